//! RouteExecutor - method + path pattern で handler を選ぶ Executor
//!
//! Patterns are `/`-separated; a `{name}` segment captures one path segment.
//! The query string, if any, is ignored for matching.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{Task, TaskResponse};
use crate::ports::Executor;

/// What a route handler sees.
#[derive(Debug)]
pub struct RouteRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub params: HashMap<String, String>,
    pub payload: &'a str,
}

impl RouteRequest<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

type Handler = Box<dyn Fn(&RouteRequest<'_>) -> (i32, String) + Send + Sync>;

enum Segment {
    Literal(String),
    Capture(String),
}

struct Route {
    method: String,
    segments: Vec<Segment>,
    handler: Handler,
}

impl Route {
    fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts = split_path(path);
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Capture(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|part| !part.is_empty()).collect()
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    split_path(pattern)
        .into_iter()
        .map(|part| match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            Some(name) => Segment::Capture(name.to_string()),
            None => Segment::Literal(part.to_string()),
        })
        .collect()
}

#[derive(Default)]
pub struct RouteExecutor {
    routes: Vec<Route>,
}

impl RouteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Earlier routes win when several match.
    pub fn route<F>(mut self, method: &str, pattern: &str, handler: F) -> Self
    where
        F: Fn(&RouteRequest<'_>) -> (i32, String) + Send + Sync + 'static,
    {
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            segments: parse_pattern(pattern),
            handler: Box::new(handler),
        });
        self
    }

    /// Routes served by the demo runner.
    pub fn demo() -> Self {
        Self::new()
            .route("GET", "/status", |_| (200, "Runner is alive".to_string()))
            .route("GET", "/data", |_| {
                (200, "Here is some data from the runner".to_string())
            })
            .route("GET", "/custom/{param}", |req| {
                let param = req.param("param").unwrap_or_default();
                (200, format!("You requested parameter: {param}"))
            })
            .route("POST", "/example", |req| {
                (200, format!("Processed example task with body: {}", req.payload))
            })
    }

    fn handle(&self, method: &str, path: &str, payload: &str) -> (i32, String) {
        let method = method.to_ascii_uppercase();
        let mut path_matched = false;
        for route in &self.routes {
            let Some(params) = route.captures(path) else {
                continue;
            };
            if route.method != method {
                path_matched = true;
                continue;
            }
            let request = RouteRequest {
                method: &method,
                path,
                params,
                payload,
            };
            return (route.handler)(&request);
        }

        if path_matched {
            (405, "method not allowed".to_string())
        } else {
            (404, "not found".to_string())
        }
    }
}

#[async_trait]
impl Executor for RouteExecutor {
    async fn execute(&self, task: Task) -> TaskResponse {
        let (status, body) = self.handle(&task.method, &task.target, &task.payload);
        debug!(task = %task.id, path = %task.target, status, "task executed");
        TaskResponse::new(task.id, status, body)
    }
}

impl std::fmt::Debug for RouteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteExecutor")
            .field("routes", &self.routes.len())
            .finish()
    }
}
