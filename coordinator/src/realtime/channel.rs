use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::transport::PushTransport;
use crate::api::types::{QrRequestId, QrStatus, RawStatusEvent, StatusEvent};
use crate::config_store::RealtimeConfig;

/// Invoked at most once, with the first terminal event of a subscription.
pub type TerminalHandler = Box<dyn FnOnce(StatusEvent) + Send + 'static>;

struct ActiveSubscription {
    request_id: QrRequestId,
    generation: u64,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Single-slot subscription to QR status updates.
///
/// At most one subscription is live. Subscribing again tears down the
/// previous one first, and a subscription ends for good once it has
/// delivered a terminal event.
#[derive(Clone)]
pub struct StatusChannel {
    transport: Arc<dyn PushTransport>,
    topic_prefix: String,
    reconnect_delay: Duration,
    active: Arc<Mutex<Option<ActiveSubscription>>>,
    generation: Arc<AtomicU64>,
}

impl fmt::Debug for StatusChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StatusChannel")
            .field("transport", &self.transport)
            .field("active", &self.active_request())
            .finish()
    }
}

impl StatusChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        topic_prefix: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            transport,
            topic_prefix: topic_prefix.into(),
            reconnect_delay,
            active: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(transport: Arc<dyn PushTransport>, config: &RealtimeConfig) -> Self {
        Self::new(transport, config.topic_prefix.clone(), config.reconnect_delay())
    }

    /// Watch `request_id` until it reaches a terminal status.
    ///
    /// `on_terminal` runs while the subscription slot is locked, so it must
    /// not call back into this channel.
    pub fn subscribe<F>(&self, request_id: QrRequestId, on_terminal: F)
    where
        F: FnOnce(StatusEvent) + Send + 'static,
    {
        let mut slot = self.active.lock();
        if let Some(previous) = slot.take() {
            log::debug!("Replacing subscription for QR request {}", previous.request_id);
            previous.stop();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(
            request_id.clone(),
            generation,
            Box::new(on_terminal),
            shutdown_rx,
        ));

        log::info!("Subscribed to status updates for QR request {}", request_id);
        *slot = Some(ActiveSubscription {
            request_id,
            generation,
            shutdown,
            task,
        });
    }

    /// Release the live subscription, if any.
    pub fn unsubscribe(&self) {
        if let Some(active) = self.active.lock().take() {
            log::debug!("Unsubscribed from QR request {}", active.request_id);
            active.stop();
        }
    }

    pub fn active_request(&self) -> Option<QrRequestId> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.request_id.clone())
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.lock().is_some()
    }

    async fn run(
        self,
        request_id: QrRequestId,
        generation: u64,
        on_terminal: TerminalHandler,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let destination = format!("{}{}", self.topic_prefix, request_id);
        let mut on_terminal = Some(on_terminal);

        loop {
            if *shutdown.borrow() {
                return;
            }

            let opened = tokio::select! {
                _ = shutdown.changed() => return,
                opened = self.transport.open(&destination) => opened,
            };

            match opened {
                Ok(mut messages) => loop {
                    let next = tokio::select! {
                        _ = shutdown.changed() => return,
                        next = messages.next() => next,
                    };
                    match next {
                        Some(Ok(body)) => {
                            let Some(event) = parse_event(&body, &request_id) else {
                                continue;
                            };
                            if !event.status.is_terminal() {
                                log::debug!(
                                    "QR request {} is now {:?}",
                                    request_id,
                                    event.status
                                );
                                continue;
                            }
                            self.deliver(generation, event, &mut on_terminal);
                            return;
                        }
                        Some(Err(e)) => {
                            log::warn!("Realtime connection for {} failed: {}", destination, e);
                            break;
                        }
                        None => {
                            log::info!("Realtime connection for {} closed", destination);
                            break;
                        }
                    }
                },
                Err(e) => log::warn!("Could not open realtime connection: {}", e),
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            log::debug!("Reconnecting to {}", destination);
        }
    }

    fn deliver(
        &self,
        generation: u64,
        event: StatusEvent,
        on_terminal: &mut Option<TerminalHandler>,
    ) {
        let mut slot = self.active.lock();
        let current = matches!(slot.as_ref(), Some(active) if active.generation == generation);
        if !current {
            log::debug!("Dropping event for replaced subscription {}", event.request_id);
            return;
        }

        // Dropping the slot detaches this task; it returns right after.
        slot.take();
        if let Some(handler) = on_terminal.take() {
            handler(event);
        }
    }
}

fn parse_event(body: &str, request_id: &QrRequestId) -> Option<StatusEvent> {
    let raw: RawStatusEvent = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("Ignoring unreadable status payload: {}", e);
            return None;
        }
    };

    if let Some(id) = &raw.qr_id {
        if id != request_id {
            log::debug!("Ignoring status for other QR request {}", id);
            return None;
        }
    }

    let Some(status) = QrStatus::parse(&raw.status) else {
        log::warn!("Ignoring unknown QR status '{}'", raw.status);
        return None;
    };

    Some(StatusEvent {
        request_id: request_id.clone(),
        status,
        message: raw.message,
        amount: raw.amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryBackend;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn channel(backend: &InMemoryBackend) -> StatusChannel {
        StatusChannel::new(
            Arc::new(backend.clone()),
            "/topic/qr/",
            Duration::from_millis(20),
        )
    }

    fn recorder() -> (
        impl FnOnce(StatusEvent) + Send + 'static,
        mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    async fn wait_for_connections(backend: &InMemoryBackend, count: usize) {
        for _ in 0..100 {
            if backend.push_connections_opened() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("push connection was never opened");
    }

    #[test]
    fn payloads_for_other_requests_are_ignored() {
        let id = QrRequestId::new("42");
        assert!(parse_event(r#"{"status":"PAID","qrId":"41"}"#, &id).is_none());
        assert!(parse_event("not json", &id).is_none());
        assert!(parse_event(r#"{"status":"LOST"}"#, &id).is_none());

        let event = parse_event(r#"{"status":"PAID","qrId":42,"amount":500}"#, &id).unwrap();
        assert_eq!(event.status, QrStatus::Paid);
        assert_eq!(event.request_id, id);
    }

    #[tokio::test]
    async fn terminal_event_is_delivered_once() {
        let backend = InMemoryBackend::new();
        let channel = channel(&backend);
        let (handler, mut events) = recorder();

        channel.subscribe(QrRequestId::new("7"), handler);
        wait_for_connections(&backend, 1).await;

        backend.publish("/topic/qr/7", r#"{"status":"SCANNED","qrId":"7"}"#);
        backend.publish("/topic/qr/7", r#"{"status":"PAID","qrId":"7"}"#);
        backend.publish("/topic/qr/7", r#"{"status":"PAID","qrId":"7"}"#);

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, QrStatus::Paid);
        assert!(timeout(Duration::from_millis(100), events.recv())
            .await
            .unwrap()
            .is_none());
        assert!(!channel.is_subscribed());
    }

    #[tokio::test]
    async fn reconnects_after_connection_drop() {
        let backend = InMemoryBackend::new();
        let channel = channel(&backend);
        let (handler, mut events) = recorder();

        channel.subscribe(QrRequestId::new("9"), handler);
        wait_for_connections(&backend, 1).await;
        backend.drop_push_connections();
        wait_for_connections(&backend, 2).await;

        backend.publish("/topic/qr/9", r#"{"status":"EXPIRED"}"#);
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, QrStatus::Expired);
    }

    #[tokio::test]
    async fn resubscribe_silences_previous_request() {
        let backend = InMemoryBackend::new();
        let channel = channel(&backend);
        let (first, mut first_events) = recorder();
        let (second, mut second_events) = recorder();

        channel.subscribe(QrRequestId::new("1"), first);
        wait_for_connections(&backend, 1).await;
        channel.subscribe(QrRequestId::new("2"), second);
        assert_eq!(channel.active_request(), Some(QrRequestId::new("2")));

        backend.publish("/topic/qr/1", r#"{"status":"PAID"}"#);
        backend.publish("/topic/qr/2", r#"{"status":"FAILED"}"#);

        let event = timeout(Duration::from_secs(1), second_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, QrStatus::Failed);
        assert!(first_events.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_is_always_safe() {
        let backend = InMemoryBackend::new();
        let channel = channel(&backend);
        channel.unsubscribe();

        let (handler, mut events) = recorder();
        channel.subscribe(QrRequestId::new("5"), handler);
        channel.unsubscribe();
        channel.unsubscribe();
        assert!(!channel.is_subscribed());

        backend.publish("/topic/qr/5", r#"{"status":"PAID"}"#);
        assert!(events.recv().await.is_none());
    }
}
