//! Connection engine.
//!
//! One dedicated worker thread per connection drives the lifecycle
//! `establish → handle → close` until asked to stop, reconnecting with a
//! backoff after every failure. All other threads only adjust settings,
//! enqueue input events, take framebuffer snapshots, or observe events.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::vnc::client::{HandshakeError, RfbClient, SecurityContext, ServerMessage, UpdateRect};
use crate::vnc::encoding;
use crate::vnc::event::MessageEvent;
use crate::vnc::framebuffer::{FramebufferImage, FramebufferStore};
use crate::vnc::interfaces::{
    ConnectionEvent, CredentialProvider, ReachabilityProbe, ServiceDefaults,
};
use crate::vnc::types::{
    ConnectionQuality, FramebufferPhase, PixelFormat, SessionInfo, State, VeyonAuthType,
};

/// Poll window per worker-loop iteration.
pub const MESSAGE_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
/// Abandon a session whose first framebuffer update never arrives.
pub const INITIAL_FRAMEBUFFER_TIMEOUT: Duration = Duration::from_secs(5);
/// Soft budget for the worker thread to wind down.
pub const THREAD_TERMINATION_TIMEOUT: Duration = Duration::from_secs(3);

/// TCP connect budget per attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Floor for the delay between reconnect attempts.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

// ── Shared engine state ─────────────────────────────────────────────────

struct Settings {
    host: String,
    /// Negative = use the configured default service port.
    port: i32,
    /// Outbound event queue, guarded together with host/port.
    queue: VecDeque<MessageEvent>,
}

struct Counters {
    frame_count: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: Mutex<Option<String>>,
}

struct Shared {
    settings: Mutex<Settings>,
    quality: Mutex<ConnectionQuality>,
    preferred_auth: Mutex<VeyonAuthType>,
    update_interval_ms: AtomicU64,
    state: Mutex<State>,
    interrupted: AtomicBool,
    sleeper_lock: Mutex<()>,
    sleeper_cond: Condvar,
    framebuffer: FramebufferStore,
    observers: Mutex<Vec<Sender<ConnectionEvent>>>,
    credentials: Arc<dyn CredentialProvider>,
    probe: Arc<dyn ReachabilityProbe>,
    defaults: ServiceDefaults,
    counters: Counters,
}

impl Shared {
    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Interruptible delay; wakes early on [`wake`](Self::wake).
    fn sleep(&self, duration: Duration) {
        let guard = self.sleeper_lock.lock().unwrap();
        if self.is_interrupted() {
            return;
        }
        let _ = self.sleeper_cond.wait_timeout(guard, duration);
    }

    fn wake(&self) {
        let _guard = self.sleeper_lock.lock().unwrap();
        self.sleeper_cond.notify_all();
    }

    /// Publish a new state, notifying observers on change only.
    fn set_state(&self, new_state: State) {
        let mut state = self.state.lock().unwrap();
        if *state != new_state {
            *state = new_state;
            drop(state);
            log::debug!("state -> {new_state}");
            self.emit(ConnectionEvent::StateChanged(new_state));
        }
    }

    fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    fn emit(&self, event: ConnectionEvent) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ── Public handle ───────────────────────────────────────────────────────

/// A reconnecting VNC client connection.
///
/// Created disconnected; [`start`](Self::start) spawns the worker which
/// keeps the session alive until [`stop`](Self::stop). Dropping the
/// handle stops the worker and waits a bounded time for it to finish.
pub struct VncConnection {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VncConnection {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        probe: Arc<dyn ReachabilityProbe>,
        defaults: ServiceDefaults,
    ) -> Self {
        let preferred_auth = defaults.authentication_method;
        Self {
            shared: Arc::new(Shared {
                settings: Mutex::new(Settings {
                    host: String::new(),
                    port: -1,
                    queue: VecDeque::new(),
                }),
                quality: Mutex::new(ConnectionQuality::default()),
                preferred_auth: Mutex::new(preferred_auth),
                update_interval_ms: AtomicU64::new(0),
                state: Mutex::new(State::Disconnected),
                interrupted: AtomicBool::new(false),
                sleeper_lock: Mutex::new(()),
                sleeper_cond: Condvar::new(),
                framebuffer: FramebufferStore::new(),
                observers: Mutex::new(Vec::new()),
                credentials,
                probe,
                defaults,
                counters: Counters {
                    frame_count: AtomicU64::new(0),
                    bytes_sent: AtomicU64::new(0),
                    bytes_received: AtomicU64::new(0),
                    connected_at: Mutex::new(None),
                },
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register an observer; events arrive in worker-thread order.
    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.observers.lock().unwrap().push(tx);
        rx
    }

    // ── Settings ────────────────────────────────────────────────────

    /// Set the target host, normalizing the common address spellings:
    /// an IPv6-mapped IPv4 address is flattened, `::1` becomes the IPv4
    /// loopback, and a bare `host:port` captures the port.
    pub fn set_host(&self, host: &str) {
        let (host, port) = normalize_host(host);
        let mut settings = self.shared.settings.lock().unwrap();
        settings.host = host;
        if let Some(port) = port {
            settings.port = port;
        }
    }

    pub fn host(&self) -> String {
        self.shared.settings.lock().unwrap().host.clone()
    }

    /// Set the target port. Negative values are ignored; the `-1`
    /// sentinel (use the configured default) is only ever set at
    /// construction. Port 0 is accepted and forwarded unchanged.
    pub fn set_port(&self, port: i32) {
        if port >= 0 {
            self.shared.settings.lock().unwrap().port = port;
        }
    }

    pub fn port(&self) -> i32 {
        self.shared.settings.lock().unwrap().port
    }

    pub fn set_quality(&self, quality: ConnectionQuality) {
        *self.shared.quality.lock().unwrap() = quality;
    }

    /// Preferred credential scheme for the security sub-handshake.
    pub fn set_veyon_auth_type(&self, auth_type: VeyonAuthType) {
        *self.shared.preferred_auth.lock().unwrap() = auth_type;
    }

    /// Interval between framebuffer update requests in milliseconds;
    /// 0 = poll continuously, sleeping only in the message wait.
    pub fn set_framebuffer_update_interval(&self, millis: u64) {
        self.shared.update_interval_ms.store(millis, Ordering::Relaxed);
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the worker loop. No-op while a worker is already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                if !self.shared.is_interrupted() {
                    return;
                }
                // A stopped worker is still winding down; give it a
                // bounded window before giving up on the restart.
                let deadline = Instant::now() + THREAD_TERMINATION_TIMEOUT;
                while Instant::now() < deadline {
                    if worker.as_ref().is_some_and(|h| h.is_finished()) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                if worker.as_ref().is_some_and(|h| !h.is_finished()) {
                    log::warn!("connection worker still winding down, not restarting");
                    return;
                }
            }
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }

        self.shared.interrupted.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("vnc-connection".into())
            .spawn(move || run_worker(shared))
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => log::error!("failed to spawn connection worker: {e}"),
        }
    }

    /// Ask the worker to stop: clears the scaled mirror, raises the
    /// interruption flag and wakes the sleeper. Termination is always
    /// cooperative; a worker stuck in a blocking socket call finishes
    /// when that call returns. Idempotent.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.shared.framebuffer.clear_scaled();
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    /// Point the connection at a new host. While the worker is retrying
    /// (running but not connected) the host swap alone is enough; an
    /// established or stopped connection is restarted.
    pub fn reset(&self, host: &str) {
        if self.state() != State::Connected && self.is_running() {
            self.set_host(host);
            self.shared.wake();
        } else {
            self.stop();
            self.set_host(host);
            self.start();
        }
    }

    // ── Framebuffer access ──────────────────────────────────────────

    /// Snapshot of the current framebuffer (empty before the first
    /// session initializes it).
    pub fn image(&self) -> FramebufferImage {
        self.shared.framebuffer.image()
    }

    pub fn set_scaled_size(&self, size: Option<(u16, u16)>) {
        self.shared.framebuffer.set_scaled_size(size);
    }

    pub fn scaled_image(&self) -> Option<FramebufferImage> {
        self.shared.framebuffer.scaled_image()
    }

    /// Recompute the scaled mirror if it is stale.
    pub fn rescale_screen(&self) {
        self.shared.framebuffer.rescale();
    }

    // ── Input events ────────────────────────────────────────────────

    /// Queue an event for the server. Dropped silently unless the
    /// connection is established, so a detached connection cannot
    /// accumulate stale input.
    pub fn enqueue_event(&self, event: MessageEvent) {
        let mut settings = self.shared.settings.lock().unwrap();
        if self.shared.state() != State::Connected {
            return;
        }
        settings.queue.push_back(event);
    }

    pub fn send_pointer_event(&self, x: u16, y: u16, button_mask: u8) {
        self.enqueue_event(MessageEvent::Pointer { x, y, button_mask });
    }

    pub fn send_key_event(&self, key: u32, down: bool) {
        self.enqueue_event(MessageEvent::Key { key, down });
    }

    pub fn send_clipboard(&self, text: &str) {
        self.enqueue_event(MessageEvent::CutText(text.to_string()));
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn session_info(&self) -> SessionInfo {
        let (host, port) = {
            let settings = self.shared.settings.lock().unwrap();
            (settings.host.clone(), settings.port)
        };
        let (width, height) = self.shared.framebuffer.dimensions();
        SessionInfo {
            host,
            port,
            state: self.shared.state(),
            framebuffer_width: width,
            framebuffer_height: height,
            connected_at: self.shared.counters.connected_at.lock().unwrap().clone(),
            frame_count: self.shared.counters.frame_count.load(Ordering::Relaxed),
            bytes_sent: self.shared.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.counters.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for VncConnection {
    fn drop(&mut self) {
        self.stop();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + THREAD_TERMINATION_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Forcing a thread out of a blocking socket call is not
                // safe; let it run out on its own.
                log::warn!("connection worker still blocked, detaching");
            }
        }
    }
}

// ── Worker loop ─────────────────────────────────────────────────────────

fn run_worker(shared: Arc<Shared>) {
    while !shared.is_interrupted() {
        match establish_connection(&shared) {
            Some(mut client) => {
                handle_connection(&shared, &mut client);
                close_connection(&shared, client);
            }
            None => break,
        }
    }
    shared.set_state(State::Disconnected);
}

/// Try to connect until it works or the worker is interrupted.
fn establish_connection(shared: &Shared) -> Option<RfbClient> {
    loop {
        if shared.is_interrupted() {
            return None;
        }
        shared.set_state(State::Connecting);

        let (host, port) = {
            let settings = shared.settings.lock().unwrap();
            let port = if settings.port < 0 {
                shared.defaults.service_port
            } else {
                settings.port as u16
            };
            (settings.host.clone(), port)
        };
        let quality = *shared.quality.lock().unwrap();
        let preferred_auth = *shared.preferred_auth.lock().unwrap();

        shared.emit(ConnectionEvent::NewClient { host: host.clone(), port });

        let failure = match RfbClient::connect(&host, port, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let ctx = SecurityContext {
                    credentials: shared.credentials.as_ref(),
                    preferred_auth,
                };
                match RfbClient::establish(stream, quality, &ctx) {
                    Ok(client) => {
                        log::info!("connected to {host}:{port}");
                        *shared.counters.connected_at.lock().unwrap() =
                            Some(Utc::now().to_rfc3339());
                        shared.set_state(State::Connected);
                        return Some(client);
                    }
                    Err(e) => e,
                }
            }
            Err(e) => HandshakeError {
                error: e.into(),
                service_reachable: false,
                framebuffer_initialized: false,
            },
        };

        let diagnosis = diagnose_failure(shared, &host, &failure);
        log::debug!("connect to {host}:{port} failed ({diagnosis}): {}", failure.error);
        shared.set_state(diagnosis);

        if shared.is_interrupted() {
            return None;
        }

        let interval = Duration::from_millis(shared.update_interval_ms.load(Ordering::Relaxed));
        shared.sleep(interval.max(MIN_RECONNECT_DELAY));
    }
}

/// Classify a failed connection attempt.
fn diagnose_failure(shared: &Shared, host: &str, failure: &HandshakeError) -> State {
    if !failure.service_reachable {
        // No byte ever came back; ping tells an offline host from a
        // host whose screen service is down.
        if shared.probe.ping(host) {
            State::ServiceUnreachable
        } else {
            State::HostOffline
        }
    } else if !failure.framebuffer_initialized {
        State::AuthenticationFailed
    } else {
        State::ConnectionFailed
    }
}

/// Pump server messages and outbound events until the session dies or
/// the worker is interrupted.
fn handle_connection(shared: &Shared, client: &mut RfbClient) {
    let connection_start = Instant::now();
    let mut phase = FramebufferPhase::Initialized;
    let pixel_format = *client.pixel_format();

    let (width, height) = client.size();
    shared.framebuffer.initialize(width, height);

    while !shared.is_interrupted() {
        let iteration_start = Instant::now();

        match client.wait_for_message(MESSAGE_WAIT_TIMEOUT) {
            Err(e) => {
                log::debug!("connection lost: {e}");
                break;
            }
            Ok(true) => {
                // Drain every message that is already buffered.
                let mut healthy = true;
                loop {
                    match client.handle_server_message() {
                        Ok(message) => {
                            apply_server_message(shared, &mut phase, &pixel_format, message)
                        }
                        Err(e) => {
                            log::debug!("server message error: {e}");
                            healthy = false;
                            break;
                        }
                    }
                    match client.wait_for_message(Duration::ZERO) {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(_) => {
                            healthy = false;
                            break;
                        }
                    }
                }
                if !healthy {
                    break;
                }
            }
            Ok(false) => {}
        }

        if shared.is_interrupted() {
            break;
        }

        let (fb_width, fb_height) = shared.framebuffer.dimensions();
        let request = match phase {
            FramebufferPhase::Initialized => {
                if connection_start.elapsed() >= INITIAL_FRAMEBUFFER_TIMEOUT {
                    log::debug!("initial framebuffer timeout exceeded, reconnecting");
                    break;
                }
                // Keep asking for the full frame until the first
                // complete update lands.
                client.send_framebuffer_update_request(0, 0, fb_width, fb_height, false)
            }
            FramebufferPhase::FirstUpdate => {
                client.send_framebuffer_update_request(0, 0, fb_width, fb_height, false)
            }
            _ => client.send_framebuffer_update_request(0, 0, fb_width, fb_height, true),
        };
        if let Err(e) = request {
            log::debug!("update request failed: {e}");
            break;
        }

        drain_events(shared, client);

        let interval = Duration::from_millis(shared.update_interval_ms.load(Ordering::Relaxed));
        let elapsed = iteration_start.elapsed();
        if interval > elapsed && !shared.is_interrupted() {
            shared.sleep(interval - elapsed);
        }
    }

    drain_events(shared, client);
}

fn close_connection(shared: &Shared, client: RfbClient) {
    shared
        .counters
        .bytes_sent
        .fetch_add(client.bytes_sent, Ordering::Relaxed);
    shared
        .counters
        .bytes_received
        .fetch_add(client.bytes_received, Ordering::Relaxed);
    drop(client);
    shared.set_state(State::Disconnected);
}

fn apply_server_message(
    shared: &Shared,
    phase: &mut FramebufferPhase,
    pixel_format: &PixelFormat,
    message: ServerMessage,
) {
    match message {
        ServerMessage::FramebufferUpdate(rects) => {
            for rect in rects {
                match rect {
                    UpdateRect::Pixels(decoded) => {
                        let (x, y, width, height) =
                            (decoded.x, decoded.y, decoded.width, decoded.height);
                        shared.framebuffer.blit(&decoded);
                        shared.emit(ConnectionEvent::ImageUpdated { x, y, width, height });
                    }
                    UpdateRect::Copy { src_x, src_y, x, y, width, height } => {
                        shared.framebuffer.copy_rect(src_x, src_y, x, y, width, height);
                        shared.emit(ConnectionEvent::ImageUpdated { x, y, width, height });
                    }
                    UpdateRect::Cursor { pixels, mask, width, height, hot_x, hot_y } => {
                        if let Some(cursor) = encoding::cursor_image(
                            &pixels,
                            &mask,
                            width,
                            height,
                            hot_x,
                            hot_y,
                            pixel_format,
                        ) {
                            shared.emit(ConnectionEvent::CursorShapeUpdated { cursor });
                        }
                    }
                    UpdateRect::CursorPos { x, y } => {
                        shared.emit(ConnectionEvent::CursorPosChanged { x, y });
                    }
                    UpdateRect::Resize { width, height } => {
                        // The buffer is re-allocated and the first-update
                        // cycle starts over at the new size.
                        shared.framebuffer.initialize(width, height);
                        *phase = FramebufferPhase::Initialized;
                    }
                }
            }
            finish_framebuffer_update(shared, phase);
            shared.counters.frame_count.fetch_add(1, Ordering::Relaxed);
        }
        ServerMessage::Bell => shared.emit(ConnectionEvent::Bell),
        ServerMessage::CutText(text) => {
            if !text.is_empty() {
                shared.emit(ConnectionEvent::GotCut(text));
            }
        }
        ServerMessage::ColourMap => {}
    }
}

/// One complete framebuffer update was processed: advance the phase and
/// notify observers.
fn finish_framebuffer_update(shared: &Shared, phase: &mut FramebufferPhase) {
    match phase {
        FramebufferPhase::Initialized => {
            let (width, height) = shared.framebuffer.dimensions();
            shared.emit(ConnectionEvent::FramebufferSizeChanged { width, height });
            *phase = FramebufferPhase::FirstUpdate;
        }
        FramebufferPhase::FirstUpdate => *phase = FramebufferPhase::Valid,
        _ => {}
    }
    shared.emit(ConnectionEvent::FramebufferUpdateComplete);
    shared.framebuffer.mark_dirty();
}

/// Send queued events in order. The queue lock is released around each
/// send so observers are never blocked on network writes.
fn drain_events(shared: &Shared, client: &mut RfbClient) {
    let mut settings = shared.settings.lock().unwrap();
    loop {
        let Some(event) = settings.queue.pop_front() else {
            break;
        };
        drop(settings);
        if let Err(e) = event.fire(client) {
            log::warn!("failed to send client event: {e}");
        }
        settings = shared.settings.lock().unwrap();
    }
}

// ── Host parsing ────────────────────────────────────────────────────────

/// Normalize a host string; returns the host and a captured port, if the
/// input carried one. Idempotent.
pub(crate) fn normalize_host(raw: &str) -> (String, Option<i32>) {
    let host = raw.trim();

    // IPv6-mapped IPv4 form "::ffff:a.b.c.d": some resolvers choke on
    // it, the plain IPv4 form always works.
    let lower = host.to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix("::ffff:") {
        if rest.parse::<Ipv4Addr>().is_ok() {
            return (rest.to_string(), None);
        }
    }

    if host == "::1" {
        return (Ipv4Addr::LOCALHOST.to_string(), None);
    }

    // Bare "host:port" (exactly one colon, numeric suffix).
    if host.matches(':').count() == 1 {
        if let Some((name, port)) = host.rsplit_once(':') {
            if !name.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(port) = port.parse::<i32>() {
                    return (name.to_string(), Some(port));
                }
            }
        }
    }

    (host.to_string(), None)
}
