mod cache;
mod coordinator;
mod ingestor;
mod policy;
mod stats;
mod types;

#[cfg(test)]
mod test_support;

pub use coordinator::PersistenceCoordinator;
pub use ingestor::{IngestLoop, TransportEvent};
pub use stats::IngestStats;
pub use types::{PatientVitals, WardReading};
