//! Connectivity monitor
//!
//! Sources report raw reachability, which may flap. The monitor turns that
//! into a settled state: going offline takes effect at once, coming back
//! online only counts after it has held for the debounce window. Events are
//! emitted on settled transitions only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Raw reachability reported by the platform
pub trait ConnectivitySource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability pushed in by the application (e.g. from OS network callbacks)
pub struct ManualConnectivity {
    sender: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Something that can answer "is the backend reachable right now"
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Polls a probe on a fixed interval
pub struct ProbeConnectivity {
    sender: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ProbeConnectivity {
    /// Start polling. Reports offline until the first probe succeeds.
    pub fn spawn(probe: Arc<dyn ReachabilityProbe>, every: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        let sender = Arc::new(sender);

        let tx = sender.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = probe.probe().await;
                tx.send_if_modified(|current| {
                    if *current == reachable {
                        return false;
                    }
                    debug!("probe reports reachable={}", reachable);
                    *current = reachable;
                    true
                });
            }
        });

        Self { sender, task }
    }
}

impl ConnectivitySource for ProbeConnectivity {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Debounced view over a connectivity source
pub struct ConnectivityMonitor {
    state: watch::Receiver<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Must be called inside a Tokio runtime. The source's current value is
    /// taken as settled.
    pub fn new(source: &dyn ConnectivitySource, debounce: Duration) -> Self {
        let mut raw = source.subscribe();
        let initial = *raw.borrow_and_update();

        let (state_tx, state) = watch::channel(initial);
        let (events, _) = broadcast::channel(16);

        let task = tokio::spawn(run_debounce(raw, state_tx, events.clone(), debounce));

        Self {
            state,
            events,
            task,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Settled state as a watch channel
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }

    /// Settled transitions only
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_debounce(
    mut raw: watch::Receiver<bool>,
    state: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    debounce: Duration,
) {
    loop {
        if raw.changed().await.is_err() {
            debug!("connectivity source closed");
            return;
        }
        let online = *raw.borrow_and_update();

        if !online {
            if *state.borrow() {
                state.send_replace(false);
                info!("connectivity lost");
                let _ = events.send(ConnectivityEvent::Offline);
            }
            continue;
        }

        if *state.borrow() {
            continue;
        }

        // Online must hold for the whole window; a drop inside it cancels
        let settled = loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => break *raw.borrow(),
                changed = raw.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*raw.borrow_and_update() {
                        break false;
                    }
                    // Dropped and came back between polls; start the window over
                }
            }
        };

        if !settled {
            debug!("connectivity flapped within {:?}, ignoring", debounce);
            continue;
        }
        if *raw.borrow() {
            state.send_replace(true);
            info!("connectivity restored");
            let _ = events.send(ConnectivityEvent::Online);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_initial_state_is_taken_as_settled() {
        let source = ManualConnectivity::new(true);
        let monitor = ConnectivityMonitor::new(&source, Duration::from_millis(50));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_offline_is_immediate() {
        let source = ManualConnectivity::new(true);
        let monitor = ConnectivityMonitor::new(&source, Duration::from_millis(500));
        let mut events = monitor.subscribe();

        source.set_online(false);
        settle().await;

        assert!(!monitor.is_online());
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::Offline);
    }

    #[tokio::test]
    async fn test_online_waits_for_debounce() {
        let source = ManualConnectivity::new(false);
        let monitor = ConnectivityMonitor::new(&source, Duration::from_millis(100));
        let mut events = monitor.subscribe();

        source.set_online(true);
        settle().await;
        assert!(!monitor.is_online());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.is_online());
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::Online);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flapping_emits_nothing() {
        let source = ManualConnectivity::new(false);
        let monitor = ConnectivityMonitor::new(&source, Duration::from_millis(100));
        let mut events = monitor.subscribe();

        for _ in 0..3 {
            source.set_online(true);
            settle().await;
            source.set_online(false);
            settle().await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!monitor.is_online());
        assert!(events.try_recv().is_err());
    }

    struct FlagProbe(Arc<std::sync::atomic::AtomicBool>);

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_probe_source_follows_probe() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let source = ProbeConnectivity::spawn(
            Arc::new(FlagProbe(flag.clone())),
            Duration::from_millis(10),
        );
        let mut rx = source.subscribe();

        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|online| *online))
            .await
            .unwrap()
            .unwrap();

        flag.store(false, std::sync::atomic::Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|online| !*online))
            .await
            .unwrap()
            .unwrap();
    }
}
