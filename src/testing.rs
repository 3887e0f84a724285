//! Shared test doubles: a scripted transport factory standing in for real
//! upstream servers.
//!
//! Scripts are queues of canned outcomes; each connect attempt pops the
//! next one, so tests can express "fail twice, then succeed" directly.

use crate::config::ServerConfig;
use crate::transport::{
    NotificationHook, ToolDef, ToolOutcome, Transport, TransportError, TransportFactory,
    TransportNotification, TransportOptions, UpstreamInfo,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted behavior shared by every transport a [`ScriptedFactory`] builds.
#[derive(Default)]
pub struct Script {
    /// Outcomes for successive `start` calls; empty queue means success.
    pub start_results: Mutex<VecDeque<Result<UpstreamInfo, TransportError>>>,
    /// Outcomes for successive `list_tools` calls; empty means `default_tools`.
    pub list_results: Mutex<VecDeque<Result<Vec<ToolDef>, TransportError>>>,
    /// Outcomes for successive `call_tool` calls; empty means an echo.
    pub call_results: Mutex<VecDeque<Result<ToolOutcome, TransportError>>>,
    pub default_tools: Mutex<Vec<ToolDef>>,
    pub starts: AtomicUsize,
    pub lists: AtomicUsize,
    pub calls: AtomicUsize,
    pub closes: AtomicUsize,
    /// Auth tokens observed by successive builds.
    pub seen_tokens: Mutex<Vec<Option<String>>>,
    /// URLs observed by successive builds.
    pub seen_urls: Mutex<Vec<String>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_start(&self, result: Result<UpstreamInfo, TransportError>) {
        self.start_results.lock().unwrap().push_back(result);
    }

    pub fn push_list(&self, result: Result<Vec<ToolDef>, TransportError>) {
        self.list_results.lock().unwrap().push_back(result);
    }

    pub fn push_call(&self, result: Result<ToolOutcome, TransportError>) {
        self.call_results.lock().unwrap().push_back(result);
    }

    pub fn set_default_tools(&self, tools: Vec<ToolDef>) {
        *self.default_tools.lock().unwrap() = tools;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn upstream(name: &str) -> UpstreamInfo {
    UpstreamInfo {
        name: name.to_string(),
        version: "1.0".to_string(),
        supports_tools: true,
    }
}

pub fn tool_def(name: &str) -> ToolDef {
    ToolDef {
        name: name.to_string(),
        description: Some(format!("test tool {name}")),
        input_schema: serde_json::json!({"type": "object"}),
    }
}

/// Factory producing [`ScriptedTransport`]s bound to one shared script.
pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new(script: Arc<Script>) -> Self {
        Self { script }
    }
}

impl TransportFactory for ScriptedFactory {
    fn build(
        &self,
        config: &ServerConfig,
        options: TransportOptions,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.script
            .seen_tokens
            .lock()
            .unwrap()
            .push(options.auth_token.clone());
        self.script
            .seen_urls
            .lock()
            .unwrap()
            .push(config.url.clone());
        Ok(Box::new(ScriptedTransport {
            script: self.script.clone(),
            started: false,
            hook: None,
        }))
    }
}

pub struct ScriptedTransport {
    script: Arc<Script>,
    started: bool,
    hook: Option<NotificationHook>,
}

impl ScriptedTransport {
    /// Fire the notification hook, as a server pushing tools/list_changed.
    pub fn notify(&self, notification: TransportNotification) {
        if let Some(hook) = &self.hook {
            hook(notification);
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn start(&mut self) -> Result<UpstreamInfo, TransportError> {
        self.script.starts.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.start_results.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| Ok(upstream("scripted")));
        if result.is_ok() {
            self.started = true;
        }
        result
    }

    async fn close(&mut self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        self.started = false;
    }

    async fn list_tools(&self) -> Result<Vec<ToolDef>, TransportError> {
        self.script.lists.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.list_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.script.default_tools.lock().unwrap().clone()))
    }

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutcome, TransportError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.call_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ToolOutcome {
                content: format!("{name}({args})"),
                is_error: false,
            })
        })
    }

    fn set_notification_hook(&mut self, hook: NotificationHook) {
        self.hook = Some(hook);
    }
}
