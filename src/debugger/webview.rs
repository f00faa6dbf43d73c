//! Correlation table between script created webviews and their messages.
//!
//! Messages are delivered in arrival order per webview. A message that arrives before
//! the script registers a listener waits in the webview queue, the oldest waiting
//! messages are dropped once the queue is full.

use crate::debugger::expression::script::MessageListener;
use crate::debugger::Error;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};

/// Messages kept per webview without a listener.
const MAX_PENDING: usize = 256;

#[derive(Default)]
struct Webview {
    listener: Option<MessageListener>,
    pending: VecDeque<Value>,
}

#[derive(Default)]
pub struct WebviewBridge {
    views: HashMap<String, Webview>,
}

impl WebviewBridge {
    /// Register a new webview, return its id and the `_webviewCreate` event body.
    pub fn create(&mut self, html: String, title: Option<String>, options: Value) -> (String, Value) {
        let id = uuid::Uuid::new_v4().to_string();
        self.views.insert(id.clone(), Webview::default());
        log::debug!(target: "session", "webview {id} created");
        let body = json!({
            "id": id,
            "html": html,
            "title": title,
            "options": options,
        });
        (id, body)
    }

    /// Body of a `_webviewPostMessage` event.
    pub fn post(&self, id: &str, message: Value) -> Result<Value, Error> {
        if !self.views.contains_key(id) {
            return Err(Error::UnknownWebview(id.to_string()));
        }
        Ok(json!({ "id": id, "message": message }))
    }

    /// Set a listener, messages queued so far are delivered immediately.
    pub fn on_message(&mut self, id: &str, mut listener: MessageListener) -> Result<(), Error> {
        let view = self
            .views
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWebview(id.to_string()))?;
        while let Some(message) = view.pending.pop_front() {
            listener(message);
        }
        view.listener = Some(listener);
        Ok(())
    }

    /// Deliver a message from the client to a webview listener.
    pub fn deliver(&mut self, id: &str, message: Value) -> Result<(), Error> {
        let view = self
            .views
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWebview(id.to_string()))?;
        match view.listener.as_mut() {
            Some(listener) => listener(message),
            None => {
                if view.pending.len() >= MAX_PENDING {
                    view.pending.pop_front();
                    log::warn!(
                        target: "session",
                        "webview {id} has no listener, oldest message dropped"
                    );
                }
                view.pending.push_back(message);
            }
        }
        Ok(())
    }

    /// Drop a webview, return the `_webviewDispose` event body.
    pub fn dispose(&mut self, id: &str) -> Result<Value, Error> {
        self.views
            .remove(id)
            .ok_or_else(|| Error::UnknownWebview(id.to_string()))?;
        Ok(json!({ "id": id }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, MessageListener) {
        let received = Arc::new(Mutex::new(vec![]));
        let sink = received.clone();
        let listener: MessageListener = Box::new(move |msg| sink.lock().unwrap().push(msg));
        (received, listener)
    }

    #[test]
    fn test_fifo_per_webview() {
        let mut bridge = WebviewBridge::default();
        let (a, body) = bridge.create("<b>a</b>".to_string(), Some("A".to_string()), json!({}));
        assert_eq!(body["id"], json!(a));
        assert_eq!(body["title"], json!("A"));
        let (b, _) = bridge.create("<b>b</b>".to_string(), None, Value::Null);
        assert_ne!(a, b);

        // queued before a listener exists
        bridge.deliver(&a, json!(1)).unwrap();
        bridge.deliver(&a, json!(2)).unwrap();
        bridge.deliver(&b, json!("b1")).unwrap();

        let (received_a, listener) = recorder();
        bridge.on_message(&a, listener).unwrap();
        bridge.deliver(&a, json!(3)).unwrap();
        assert_eq!(*received_a.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);

        let (received_b, listener) = recorder();
        bridge.on_message(&b, listener).unwrap();
        assert_eq!(*received_b.lock().unwrap(), vec![json!("b1")]);
    }

    #[test]
    fn test_post_and_dispose() {
        let mut bridge = WebviewBridge::default();
        let (id, _) = bridge.create(String::new(), None, Value::Null);

        let body = bridge.post(&id, json!({"k": 1})).unwrap();
        assert_eq!(body, json!({"id": id, "message": {"k": 1}}));

        assert_eq!(bridge.dispose(&id).unwrap(), json!({ "id": id }));
        assert!(matches!(bridge.post(&id, Value::Null), Err(Error::UnknownWebview(_))));
        assert!(matches!(bridge.deliver(&id, Value::Null), Err(Error::UnknownWebview(_))));
        assert!(matches!(bridge.dispose(&id), Err(Error::UnknownWebview(_))));
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let mut bridge = WebviewBridge::default();
        let (id, _) = bridge.create(String::new(), None, Value::Null);
        for i in 0..MAX_PENDING + 2 {
            bridge.deliver(&id, json!(i)).unwrap();
        }

        let (received, listener) = recorder();
        bridge.on_message(&id, listener).unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), MAX_PENDING);
        assert_eq!(received[0], json!(2));
        assert_eq!(received[MAX_PENDING - 1], json!(MAX_PENDING + 1));
    }
}
