use crate::layout::{FieldName, GroupId, PipelineLayout};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub group: GroupId,
    pub field: FieldName,
}

/// Static topic → slot table. Built once from the layout and never mutated.
#[derive(Clone, Debug)]
pub struct TopicRouter {
    routes: HashMap<String, Route>,
}

impl TopicRouter {
    pub fn from_layout(layout: &PipelineLayout) -> Self {
        let routes = layout
            .routes
            .iter()
            .map(|route| {
                (
                    route.topic.clone(),
                    Route {
                        group: route.group.clone(),
                        field: route.field.clone(),
                    },
                )
            })
            .collect();
        Self { routes }
    }

    pub fn resolve(&self, topic: &str) -> Option<&Route> {
        self.routes.get(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }
}
