//! Clock & tickers (§4.6). Grounded in the same pattern the TUI event
//! loop uses: a background thread owns a cloned `Sender` and merges its
//! own timer fires onto the *same* channel the rest of the pipeline
//! publishes to, so the consuming stage only ever reads one `Receiver`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::segment::Block;

/// Everything the block-processing stage can receive on its one
/// channel: a segmented block, the output-gating tick, the slower
/// informational debug tick, or an externally supplied timestamp that
/// advances the clock in place of the wall-clock ticker (§4.6, §5).
pub enum EngineEvent {
    Block(Block),
    Tick,
    DebugTick,
    ExternalTick(NaiveDateTime),
}

/// Spawns the internal wall-clock ticker used when the caller supplies
/// no external time-source channel. Exits once `shutdown` is set or the
/// receiving end is dropped.
pub fn spawn_wall_clock(
    tx: Sender<EngineEvent>,
    output_duration: Duration,
    debug_duration: Duration,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut since_debug = Duration::ZERO;
        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(output_duration);
            if tx.send(EngineEvent::Tick).is_err() {
                break;
            }
            since_debug += output_duration;
            if since_debug >= debug_duration {
                since_debug = Duration::ZERO;
                if tx.send(EngineEvent::DebugTick).is_err() {
                    break;
                }
            }
        }
    })
}

/// When the caller supplies an external time-source channel, each
/// timestamp it produces advances the controller's clock instead of the
/// wall-clock ticker (§4.6). Each received timestamp is relayed onto the
/// merged channel as an `ExternalTick` carrying that timestamp, which
/// the engine loop uses directly for emission timing and `ServerEvent`
/// stamping.
pub fn forward_external_clock(
    tx: Sender<EngineEvent>,
    external: Receiver<NaiveDateTime>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for ts in external {
            if tx.send(EngineEvent::ExternalTick(ts)).is_err() {
                break;
            }
        }
    })
}

/// Spawns the slower, informational-only debug ticker (§4.6) alongside
/// an external clock source, which otherwise carries no periodic
/// heartbeat of its own. Exits once `shutdown` is set or the receiving
/// end is dropped.
pub fn spawn_debug_ticker(
    tx: Sender<EngineEvent>,
    debug_duration: Duration,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(debug_duration);
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(EngineEvent::DebugTick).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn wall_clock_fires_ticks_at_interval() {
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_wall_clock(
            tx,
            Duration::from_millis(5),
            Duration::from_secs(3600),
            shutdown.clone(),
        );
        let evt = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(evt, EngineEvent::Tick));
        shutdown.store(true, Ordering::SeqCst);
        // Drain until the thread observes shutdown and exits; bounded by
        // the recv timeout so a missed wakeup can't hang the test.
        while rx.recv_timeout(Duration::from_millis(50)).is_ok() {}
        let _ = handle.join();
    }

    #[test]
    fn external_clock_relays_timestamp() {
        let (tx, rx) = mpsc::channel();
        let (ext_tx, ext_rx) = mpsc::channel();
        let handle = forward_external_clock(tx, ext_rx);
        let ts = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        ext_tx.send(ts).unwrap();
        drop(ext_tx);
        let evt = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match evt {
            EngineEvent::ExternalTick(got) => assert_eq!(got, ts),
            _ => panic!("expected an ExternalTick carrying the sent timestamp"),
        }
        let _ = handle.join();
    }

    #[test]
    fn debug_ticker_fires_at_interval() {
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_debug_ticker(tx, Duration::from_millis(5), shutdown.clone());
        let evt = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(evt, EngineEvent::DebugTick));
        shutdown.store(true, Ordering::SeqCst);
        while rx.recv_timeout(Duration::from_millis(50)).is_ok() {}
        let _ = handle.join();
    }
}
