use crate::services::llm::{ChatParams, LlmClient};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub system: String,
    pub user: String,
    pub params: ChatParams,
}

#[derive(Debug, Default)]
pub struct ScriptedLlm {
    routes: Mutex<Vec<(String, Vec<Reply>)>>,
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: &str, reply: &str) -> Self {
        self.push(marker, Reply::Text(reply.to_string()));
        self
    }

    pub fn failing_on(self, marker: &str) -> Self {
        self.push(marker, Reply::Fail);
        self
    }

    fn push(&self, marker: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(m, _)| m == marker) {
            Some((_, replies)) => replies.push(reply),
            None => routes.push((marker.to_string(), vec![reply])),
        }
    }

    pub fn calls_to(&self, marker: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.system.contains(marker)).count()
    }

    pub fn last_call_to(&self, marker: &str) -> Option<Call> {
        self.calls.lock().unwrap().iter().rev().find(|c| c.system.contains(marker)).cloned()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, system: &str, user: &str, params: ChatParams) -> Result<String> {
        self.calls.lock().unwrap().push(Call {
            system: system.to_string(),
            user: user.to_string(),
            params,
        });

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            let (_, replies) = routes
                .iter_mut()
                .find(|(marker, _)| system.contains(marker.as_str()))
                .ok_or_else(|| anyhow!("no scripted reply"))?;
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            }
        };

        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail => Err(anyhow!("scripted failure")),
        }
    }
}
