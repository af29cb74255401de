//! PresenceSink: Discord Rich Presence showing the current heart rate.
//!
//! The sink follows Disconnected → Connecting → Connected → Disconnected.
//! Discord starting and stopping independently of the relay is normal: a
//! missing client is an idle state, and losing it mid-session closes the
//! sink instead of surfacing an error. Nothing reconnects on its own; the
//! owner calls `connect` again (toggle on, apply settings).
//!
//! IPC calls have no timeout of their own, so each session runs its client
//! on a dedicated thread and the sink waits at most `call_timeout` for an
//! answer. A call that does not answer in time abandons the session; the
//! thread closes the client once the stalled call returns.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use discord_rich_presence::{activity, DiscordIpc, DiscordIpcClient};

use super::process::{ProcessProbe, DISCORD_PROCESSES};
use crate::error::RelayError;
use crate::journal::ActivityLog;
use crate::types::{ConnectionState, HeartRateSample};

pub const DEFAULT_LARGE_IMAGE: &str = "fas-fa-heart";
pub const LARGE_TEXT: &str = "Heart Rate Monitor";
pub const PRESENCE_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything pushed to Discord on one update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresencePayload {
    /// Session start, seconds since the Unix epoch.
    pub start: i64,
    pub large_image: String,
    pub large_text: String,
    pub small_image: Option<String>,
    pub small_text: String,
    pub details: String,
    pub state: String,
}

impl PresencePayload {
    pub fn build(
        sample: Option<HeartRateSample>,
        game_running: bool,
        start: i64,
        images: &PresenceImages,
    ) -> Self {
        let (details, state) = match sample {
            Some(sample) => (
                format!("❤ Heart Rate: {} BPM", sample.bpm()),
                "Monitoring heart rate...".to_string(),
            ),
            None => (
                "💔 Heart Rate Disconnected".to_string(),
                "Waiting for connection...".to_string(),
            ),
        };
        let small_text = if game_running {
            "VRChat Integration Active"
        } else {
            "VRChat Offline"
        };

        Self {
            start,
            large_image: images
                .large
                .clone()
                .unwrap_or_else(|| DEFAULT_LARGE_IMAGE.to_string()),
            large_text: LARGE_TEXT.to_string(),
            small_image: images.small.clone(),
            small_text: small_text.to_string(),
            details,
            state,
        }
    }
}

/// User-chosen image keys or URLs; `None` falls back to the defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PresenceImages {
    pub large: Option<String>,
    pub small: Option<String>,
}

impl PresenceImages {
    /// Blank strings count as "not set".
    pub fn new(large: Option<String>, small: Option<String>) -> Self {
        let clean = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
        Self {
            large: clean(large),
            small: clean(small),
        }
    }
}

/// A connected rich-presence IPC session.
pub trait PresenceClient: Send {
    fn set_activity(&mut self, payload: &PresencePayload) -> Result<(), RelayError>;

    fn close(&mut self) -> Result<(), RelayError>;
}

/// Performs the IPC handshake for a given application id.
pub trait PresenceConnector: Send + Sync {
    fn connect(&self, client_id: &str) -> Result<Box<dyn PresenceClient>, RelayError>;
}

/// Connector for the local Discord client's IPC pipe.
#[derive(Debug, Default)]
pub struct DiscordConnector;

impl PresenceConnector for DiscordConnector {
    fn connect(&self, client_id: &str) -> Result<Box<dyn PresenceClient>, RelayError> {
        let mut client = DiscordIpcClient::new(client_id)
            .map_err(|e| RelayError::Transport(format!("invalid client: {}", e)))?;
        client
            .connect()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(Box::new(DiscordPresenceClient { client }))
    }
}

struct DiscordPresenceClient {
    client: DiscordIpcClient,
}

impl PresenceClient for DiscordPresenceClient {
    fn set_activity(&mut self, payload: &PresencePayload) -> Result<(), RelayError> {
        let mut assets = activity::Assets::new()
            .large_image(&payload.large_image)
            .large_text(&payload.large_text)
            .small_text(&payload.small_text);
        if let Some(small) = payload.small_image.as_deref() {
            assets = assets.small_image(small);
        }

        let presence = activity::Activity::new()
            .details(&payload.details)
            .state(&payload.state)
            .assets(assets)
            .timestamps(activity::Timestamps::new().start(payload.start));

        self.client
            .set_activity(presence)
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    fn close(&mut self) -> Result<(), RelayError> {
        self.client
            .close()
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

type Reply = SyncSender<Result<(), RelayError>>;

enum Request {
    Update(PresencePayload, Reply),
    Close(Reply),
}

/// A presence client owned by its own thread.
struct IpcSession {
    requests: mpsc::Sender<Request>,
    timeout: Duration,
}

impl IpcSession {
    /// Run the handshake on a new thread and wait up to `timeout` for it.
    fn open(
        connector: Arc<dyn PresenceConnector>,
        client_id: String,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        let (requests, inbox) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("discord-ipc".to_string())
            .spawn(move || {
                let mut client = match connector.connect(&client_id) {
                    Ok(client) => client,
                    Err(e) => {
                        if ready_tx.send(Err(e)).is_err() {
                            log::debug!("Discord handshake failed after the sink gave up");
                        }
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    log::debug!("Discord handshake finished after the sink gave up");
                }

                for request in inbox {
                    match request {
                        Request::Update(payload, reply) => {
                            if reply.send(client.set_activity(&payload)).is_err() {
                                log::debug!("Discord update answered after its deadline");
                            }
                        }
                        Request::Close(reply) => {
                            if reply.send(client.close()).is_err() {
                                log::debug!("Discord close answered after its deadline");
                            }
                            return;
                        }
                    }
                }

                // Abandoned session.
                if let Err(e) = client.close() {
                    log::debug!("Closing abandoned Discord session failed: {}", e);
                }
            })?;

        Self::wait(&ready_rx, timeout, "handshake")?;
        Ok(Self { requests, timeout })
    }

    fn update(&self, payload: PresencePayload) -> Result<(), RelayError> {
        self.call(|reply| Request::Update(payload, reply), "update")
    }

    fn close(self) -> Result<(), RelayError> {
        self.call(Request::Close, "close")
    }

    fn call(&self, request: impl FnOnce(Reply) -> Request, what: &str) -> Result<(), RelayError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.requests
            .send(request(reply_tx))
            .map_err(|_| RelayError::Transport("Discord IPC thread exited".to_string()))?;
        Self::wait(&reply_rx, self.timeout, what)
    }

    fn wait(
        rx: &mpsc::Receiver<Result<(), RelayError>>,
        timeout: Duration,
        what: &str,
    ) -> Result<(), RelayError> {
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RelayError::Timeout(format!(
                "Discord {} took longer than {:?}",
                what, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(RelayError::Transport("Discord IPC thread exited".to_string()))
            }
        }
    }
}

pub struct PresenceSink {
    connector: Arc<dyn PresenceConnector>,
    probe: Arc<dyn ProcessProbe>,
    activity: ActivityLog,
    client_id: String,
    images: PresenceImages,
    state: ConnectionState,
    session: Option<IpcSession>,
    session_start: i64,
    call_timeout: Duration,
}

impl PresenceSink {
    pub fn new(
        connector: Arc<dyn PresenceConnector>,
        probe: Arc<dyn ProcessProbe>,
        activity: ActivityLog,
        client_id: impl Into<String>,
        images: PresenceImages,
    ) -> Self {
        Self {
            connector,
            probe,
            activity,
            client_id: client_id.into(),
            images,
            state: ConnectionState::Disconnected,
            session: None,
            session_start: 0,
            call_timeout: PRESENCE_CALL_TIMEOUT,
        }
    }

    /// Bound every IPC call by `timeout` instead of `PRESENCE_CALL_TIMEOUT`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Change application id and images.
    ///
    /// A different application id invalidates the current session, so the
    /// sink is closed; the caller decides whether to connect again.
    pub fn configure(&mut self, client_id: &str, images: PresenceImages) {
        if client_id != self.client_id {
            if self.is_connected() {
                self.close();
            }
            self.client_id = client_id.to_string();
        }
        self.images = images;
    }

    /// Open the IPC session. No-op when already connected or when Discord
    /// is not running.
    pub fn connect(&mut self) {
        if self.state == ConnectionState::Connected {
            return;
        }
        if !self.probe.is_running(DISCORD_PROCESSES) {
            self.activity
                .record("Discord is not running. Cannot connect Rich Presence.");
            return;
        }

        self.state = ConnectionState::Connecting;
        let opened = IpcSession::open(
            Arc::clone(&self.connector),
            self.client_id.clone(),
            self.call_timeout,
        );
        match opened {
            Ok(session) => {
                self.session = Some(session);
                self.session_start = Utc::now().timestamp();
                self.state = ConnectionState::Connected;
                self.activity.record("Discord Rich Presence connected.");
            }
            Err(e) => {
                self.activity
                    .record(format!("Could not connect to Discord: {}", e));
                self.session = None;
                self.state = ConnectionState::Disconnected;
            }
        }
    }

    /// Close the session. Idempotent; teardown errors are only logged.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            match session.close() {
                Ok(()) => self.activity.record("Discord Rich Presence disconnected."),
                Err(e) => self
                    .activity
                    .record(format!("Error closing Discord RPC: {}", e)),
            }
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Push the current heart rate. Any failure closes the sink.
    pub fn update_presence(&mut self, sample: Option<HeartRateSample>, game_running: bool) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if !self.probe.is_running(DISCORD_PROCESSES) {
            self.activity.record("Discord connection lost.");
            self.close();
            return;
        }

        let payload = PresencePayload::build(sample, game_running, self.session_start, &self.images);
        let result = match self.session.as_ref() {
            Some(session) => session.update(payload),
            None => Err(RelayError::State("connected without a client".to_string())),
        };
        match result {
            Ok(()) => {}
            Err(e @ RelayError::Timeout(_)) => {
                // The client thread is still stuck; a close would queue behind it.
                self.activity
                    .record(format!("Discord presence update failed: {}", e));
                self.session = None;
                self.state = ConnectionState::Disconnected;
            }
            Err(e) => {
                self.activity
                    .record(format!("Discord presence update failed: {}", e));
                self.close();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable fakes shared by the sink and monitor tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Process probe whose answer is set by the test.
    #[derive(Default)]
    pub struct FakeProbe {
        pub discord: AtomicBool,
        pub vrchat: AtomicBool,
    }

    impl FakeProbe {
        pub fn new(discord: bool, vrchat: bool) -> Arc<Self> {
            Arc::new(Self {
                discord: AtomicBool::new(discord),
                vrchat: AtomicBool::new(vrchat),
            })
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_running(&self, names: &[&str]) -> bool {
            if names == DISCORD_PROCESSES {
                self.discord.load(Ordering::SeqCst)
            } else {
                self.vrchat.load(Ordering::SeqCst)
            }
        }
    }

    /// Connector recording every payload its clients receive.
    #[derive(Default)]
    pub struct RecordingConnector {
        pub connects: AtomicUsize,
        pub refuse: AtomicBool,
        pub payloads: Arc<Mutex<Vec<PresencePayload>>>,
        pub client_ids: Mutex<Vec<String>>,
        connect_delay_ms: AtomicU64,
        shared: Arc<RecorderState>,
    }

    #[derive(Default)]
    struct RecorderState {
        closes: AtomicUsize,
        fail_updates: AtomicBool,
        update_delay_ms: AtomicU64,
    }

    impl RecordingConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_fail_updates(&self, fail: bool) {
            self.shared.fail_updates.store(fail, Ordering::SeqCst);
        }

        /// Make the handshake block for `delay`.
        pub fn set_connect_delay(&self, delay: Duration) {
            self.connect_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        /// Make every `set_activity` block for `delay`.
        pub fn set_update_delay(&self, delay: Duration) {
            self.shared
                .update_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        pub fn close_count(&self) -> usize {
            self.shared.closes.load(Ordering::SeqCst)
        }

        pub fn last_payload(&self) -> Option<PresencePayload> {
            self.payloads.lock().unwrap().last().cloned()
        }
    }

    impl PresenceConnector for RecordingConnector {
        fn connect(&self, client_id: &str) -> Result<Box<dyn PresenceClient>, RelayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.client_ids.lock().unwrap().push(client_id.to_string());
            let delay = self.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(RelayError::Transport("pipe not found".to_string()));
            }
            Ok(Box::new(RecordingClient {
                payloads: Arc::clone(&self.payloads),
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    struct RecordingClient {
        payloads: Arc<Mutex<Vec<PresencePayload>>>,
        shared: Arc<RecorderState>,
    }

    impl PresenceClient for RecordingClient {
        fn set_activity(&mut self, payload: &PresencePayload) -> Result<(), RelayError> {
            let delay = self.shared.update_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            if self.shared.fail_updates.load(Ordering::SeqCst) {
                return Err(RelayError::Transport("invalid session".to_string()));
            }
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<(), RelayError> {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeProbe, RecordingConnector};
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn make_sink(discord_running: bool) -> (PresenceSink, Arc<RecordingConnector>, Arc<FakeProbe>) {
        let connector = RecordingConnector::new();
        let probe = FakeProbe::new(discord_running, false);
        let sink = PresenceSink::new(
            connector.clone(),
            probe.clone(),
            ActivityLog::silent(),
            "1234",
            PresenceImages::default(),
        );
        (sink, connector, probe)
    }

    fn bpm(value: u16) -> Option<HeartRateSample> {
        HeartRateSample::new(value)
    }

    #[test]
    fn test_payload_with_sample() {
        let payload = PresencePayload::build(bpm(72), true, 100, &PresenceImages::default());
        assert_eq!(payload.details, "❤ Heart Rate: 72 BPM");
        assert_eq!(payload.state, "Monitoring heart rate...");
        assert_eq!(payload.small_text, "VRChat Integration Active");
        assert_eq!(payload.large_image, DEFAULT_LARGE_IMAGE);
        assert_eq!(payload.large_text, LARGE_TEXT);
        assert_eq!(payload.small_image, None);
        assert_eq!(payload.start, 100);
    }

    #[test]
    fn test_payload_without_sample() {
        let images = PresenceImages::new(Some("big".to_string()), Some("small".to_string()));
        let payload = PresencePayload::build(None, false, 0, &images);
        assert_eq!(payload.details, "💔 Heart Rate Disconnected");
        assert_eq!(payload.state, "Waiting for connection...");
        assert_eq!(payload.small_text, "VRChat Offline");
        assert_eq!(payload.large_image, "big");
        assert_eq!(payload.small_image.as_deref(), Some("small"));
    }

    #[test]
    fn test_blank_images_use_defaults() {
        let images = PresenceImages::new(Some("  ".to_string()), Some(String::new()));
        assert_eq!(images, PresenceImages::default());
    }

    #[test]
    fn test_connect_requires_discord() {
        let (mut sink, connector, _probe) = make_sink(false);
        sink.connect();
        assert!(!sink.is_connected());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (mut sink, connector, _probe) = make_sink(true);
        sink.connect();
        sink.connect();
        assert!(sink.is_connected());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.client_ids.lock().unwrap()[0], "1234");
    }

    #[test]
    fn test_handshake_failure_stays_disconnected() {
        let (mut sink, connector, _probe) = make_sink(true);
        connector.refuse.store(true, Ordering::SeqCst);
        sink.connect();
        assert_eq!(sink.state(), ConnectionState::Disconnected);

        connector.refuse.store(false, Ordering::SeqCst);
        sink.connect();
        assert!(sink.is_connected());
    }

    #[test]
    fn test_update_pushes_payload() {
        let (mut sink, connector, _probe) = make_sink(true);
        sink.update_presence(bpm(80), false);
        assert!(connector.last_payload().is_none());

        sink.connect();
        sink.update_presence(bpm(80), false);
        let payload = connector.last_payload().unwrap();
        assert_eq!(payload.details, "❤ Heart Rate: 80 BPM");
    }

    #[test]
    fn test_host_exit_closes_sink() {
        let (mut sink, connector, probe) = make_sink(true);
        sink.connect();

        probe.discord.store(false, Ordering::SeqCst);
        sink.update_presence(bpm(90), false);

        assert!(!sink.is_connected());
        assert_eq!(connector.close_count(), 1);
        assert!(connector.last_payload().is_none());
    }

    #[test]
    fn test_update_failure_closes_sink() {
        let (mut sink, connector, _probe) = make_sink(true);
        sink.connect();
        connector.set_fail_updates(true);

        sink.update_presence(bpm(90), true);
        assert!(!sink.is_connected());
        assert_eq!(connector.close_count(), 1);

        // Further updates are no-ops until connect() is called again.
        connector.set_fail_updates(false);
        sink.update_presence(bpm(91), true);
        assert!(connector.last_payload().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut sink, connector, _probe) = make_sink(true);
        sink.close();
        sink.connect();
        sink.close();
        sink.close();
        assert_eq!(sink.state(), ConnectionState::Disconnected);
        assert_eq!(connector.close_count(), 1);
    }

    #[test]
    fn test_configure_new_client_id_closes() {
        let (mut sink, connector, _probe) = make_sink(true);
        sink.connect();

        sink.configure("1234", PresenceImages::new(Some("x".to_string()), None));
        assert!(sink.is_connected());

        sink.configure("5678", PresenceImages::default());
        assert!(!sink.is_connected());
        assert_eq!(sink.client_id(), "5678");

        sink.connect();
        assert_eq!(connector.client_ids.lock().unwrap()[1], "5678");
    }

    #[test]
    fn test_stalled_update_abandons_session() {
        let (sink, connector, _probe) = make_sink(true);
        let mut sink = sink.with_call_timeout(Duration::from_millis(100));
        sink.connect();
        connector.set_update_delay(Duration::from_millis(1500));

        let started = Instant::now();
        sink.update_presence(bpm(90), true);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sink.state(), ConnectionState::Disconnected);

        // Nothing left to close on the caller's side.
        let started = Instant::now();
        sink.close();
        assert!(started.elapsed() < Duration::from_millis(100));

        // The client thread closes the session once the call returns.
        for _ in 0..60 {
            if connector.close_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(connector.close_count(), 1);
        assert!(connector.last_payload().is_some());
    }

    #[test]
    fn test_stalled_handshake_stays_disconnected() {
        let (sink, connector, _probe) = make_sink(true);
        let mut sink = sink.with_call_timeout(Duration::from_millis(100));
        connector.set_connect_delay(Duration::from_millis(500));

        let started = Instant::now();
        sink.connect();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(sink.state(), ConnectionState::Disconnected);

        // A handshake that completes late is closed, never used.
        for _ in 0..40 {
            if connector.close_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(connector.close_count(), 1);

        connector.set_connect_delay(Duration::ZERO);
        sink.connect();
        assert!(sink.is_connected());
    }
}
