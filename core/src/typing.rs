/// Typing indicators: keystroke debouncing for the local user and an
/// expiring flag for the peer
use crate::utils::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

/// Signal the debouncer asks to put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Receives debounced signals. Called with the burst lock held, so it must not
/// call back into the debouncer.
pub type TypingSink = Arc<dyn Fn(TypingSignal) + Send + Sync>;

#[derive(Default)]
struct Burst {
    typing: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Turns a stream of keystrokes into one start and one stop per burst.
///
/// Must be used from within a tokio runtime.
pub struct TypingDebouncer {
    quiet_period: Duration,
    sink: TypingSink,
    burst: Arc<Mutex<Burst>>,
}

impl TypingDebouncer {
    pub fn new(quiet_period: Duration, sink: TypingSink) -> Self {
        Self {
            quiet_period,
            sink,
            burst: Arc::new(Mutex::new(Burst::default())),
        }
    }

    /// Record a keystroke: starts a burst if none is running and re-arms the quiet timer
    pub fn keystroke(&self) {
        let mut burst = lock(&self.burst);
        if !burst.typing {
            burst.typing = true;
            (self.sink)(TypingSignal::Start);
        }

        burst.generation += 1;
        if let Some(timer) = burst.timer.take() {
            timer.abort();
        }

        let generation = burst.generation;
        let shared = self.burst.clone();
        let sink = self.sink.clone();
        let quiet_period = self.quiet_period;
        burst.timer = Some(tokio::spawn(async move {
            sleep(quiet_period).await;
            let mut burst = lock(&shared);
            if burst.generation == generation && burst.typing {
                trace!("Typing burst ended after quiet period");
                burst.typing = false;
                burst.timer = None;
                sink(TypingSignal::Stop);
            }
        }));
    }

    /// End the current burst right away; no-op if the user is not typing
    pub fn stop_now(&self) {
        let mut burst = lock(&self.burst);
        if !burst.typing {
            return;
        }
        burst.typing = false;
        burst.generation += 1;
        if let Some(timer) = burst.timer.take() {
            timer.abort();
        }
        (self.sink)(TypingSignal::Stop);
    }

    pub fn is_typing(&self) -> bool {
        lock(&self.burst).typing
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.burst).timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct PeerTimer {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Peer "is typing" flag that clears itself if the stop signal never arrives
pub struct PeerTypingIndicator {
    timeout: Duration,
    flag: Arc<watch::Sender<bool>>,
    timer: Arc<Mutex<PeerTimer>>,
}

impl PeerTypingIndicator {
    pub fn new(timeout: Duration) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            timeout,
            flag: Arc::new(flag),
            timer: Arc::new(Mutex::new(PeerTimer::default())),
        }
    }

    /// Apply a peer typing signal; `true` (re)arms the expiry timer
    pub fn on_signal(&self, typing: bool) {
        let mut state = lock(&self.timer);
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        set_flag(&self.flag, typing);

        if typing {
            let generation = state.generation;
            let shared = self.timer.clone();
            let flag = self.flag.clone();
            let timeout = self.timeout;
            state.timer = Some(tokio::spawn(async move {
                sleep(timeout).await;
                let mut state = lock(&shared);
                if state.generation == generation {
                    trace!("Peer typing indicator expired");
                    state.timer = None;
                    set_flag(&flag, false);
                }
            }));
        }
    }

    /// Clear the flag and cancel any pending expiry
    pub fn reset(&self) {
        self.on_signal(false);
    }

    pub fn is_typing(&self) -> bool {
        *self.flag.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

fn set_flag(flag: &watch::Sender<bool>, typing: bool) {
    flag.send_if_modified(|current| {
        let changed = *current != typing;
        *current = typing;
        changed
    });
}

impl Drop for PeerTypingIndicator {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).timer.take() {
            timer.abort();
        }
    }
}
