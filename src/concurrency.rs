//! Bounded worker pool and cooperative cancellation.
//!
//! All parallel work here is I/O-bound (git subprocesses, HTTP), so the pool
//! is a fixed set of tokio tasks pulling from a shared queue. Cancellation is
//! checked only between items: an in-flight git command always runs to
//! completion so a repository is never left mid-operation.

use std::collections::VecDeque;
use std::future::Future;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

/// A normalized concurrency level plus the warning to show, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencySetting {
    pub value: usize,
    pub warning: Option<String>,
}

/// Parse user text into a number; anything unparseable becomes NaN so that
/// [`normalize_concurrency`] reports it rather than silently defaulting.
pub fn parse_concurrency(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(raw.parse::<f64>().unwrap_or(f64::NAN))
}

/// Clamp a requested concurrency level into `[1, 10]`.
///
/// | input | result |
/// |-------|--------|
/// | missing | default, no warning |
/// | NaN/inf, or `<= 0` | default, warning |
/// | below 1 | 1, warning |
/// | above 10 | 10, warning |
/// | fractional | floored, warning |
pub fn normalize_concurrency(input: Option<f64>) -> ConcurrencySetting {
    let Some(value) = input else {
        return ConcurrencySetting {
            value: DEFAULT_CONCURRENCY,
            warning: None,
        };
    };

    let (value, warning) = if !value.is_finite() {
        (
            DEFAULT_CONCURRENCY,
            format!("is not a number; using default {}", DEFAULT_CONCURRENCY),
        )
    } else if value <= 0.0 {
        (
            DEFAULT_CONCURRENCY,
            format!(
                "must be >= {} (got {}); using default {}",
                MIN_CONCURRENCY, value, DEFAULT_CONCURRENCY
            ),
        )
    } else if value < MIN_CONCURRENCY as f64 {
        (
            MIN_CONCURRENCY,
            format!("raised to minimum of {} (got {})", MIN_CONCURRENCY, value),
        )
    } else if value > MAX_CONCURRENCY as f64 {
        (
            MAX_CONCURRENCY,
            format!("capped at maximum of {} (got {})", MAX_CONCURRENCY, value),
        )
    } else if value.fract() != 0.0 {
        (
            value.floor() as usize,
            format!("rounded down to {} (got {})", value.floor(), value),
        )
    } else {
        return ConcurrencySetting {
            value: value as usize,
            warning: None,
        };
    };

    ConcurrencySetting {
        value,
        warning: Some(warning),
    }
}

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("cancellation requested; finishing in-flight work");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run `worker` over `items` with at most `limit` in flight.
///
/// Results arrive on the returned channel in completion order. The channel
/// closes once every worker has exited, which happens when the queue is
/// drained or, after cancellation, when each worker finishes its current item.
pub fn run_with_concurrency<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: CancelSignal,
    worker: F,
) -> mpsc::UnboundedReceiver<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let workers = limit.max(1).min(items.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let worker = Arc::new(worker);

    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    if let Ok(mut q) = queue.lock() {
                        q.clear();
                    }
                    break;
                }
                let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                let Some(item) = next else {
                    break;
                };
                let result = worker(item).await;
                if tx.send(result).is_err() {
                    break;
                }
            }
        });
    }

    rx
}

/// Keeps the signal listeners alive; dropping it stops them and restores
/// the terminal mode.
pub struct CancelGuard {
    tasks: Vec<JoinHandle<()>>,
    stop_reader: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
    raw_terminal: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        // The reader wakes at least every read timeout, so this join is short.
        self.stop_reader.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if self.raw_terminal {
            set_terminal_canonical(true);
        }
    }
}

const ESCAPE: u8 = 0x1b;

/// Watch terminal input for a lone escape key.
///
/// Keys such as arrows arrive as one burst starting with ESC, so only an ESC
/// followed by a quiet read (`Ok(0)`, the terminal read timeout) cancels.
/// Runs until `stop` is set or input fails.
fn watch_escape(mut input: impl Read, signal: &CancelSignal, stop: &AtomicBool) {
    let mut buf = [0u8; 32];
    let mut pending_escape = false;
    while !stop.load(Ordering::SeqCst) {
        let n = match input.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            if pending_escape {
                signal.cancel();
                return;
            }
            continue;
        }
        // Bytes right after an ESC are the tail of a sequence.
        pending_escape = !pending_escape && buf[..n] == [ESCAPE];
    }
}

/// Wire ctrl-c, SIGTERM and (on a terminal) the escape key to `signal`.
pub fn install_handlers(signal: &CancelSignal) -> CancelGuard {
    let mut tasks = Vec::new();

    let on_interrupt = signal.clone();
    tasks.push(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    }));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let on_term = signal.clone();
        if let Ok(mut term) = unix_signal(SignalKind::terminate()) {
            tasks.push(tokio::spawn(async move {
                if term.recv().await.is_some() {
                    on_term.cancel();
                }
            }));
        }
    }

    let stop_reader = Arc::new(AtomicBool::new(false));
    let raw_terminal = atty::is(atty::Stream::Stdin) && set_terminal_canonical(false);
    let reader = raw_terminal.then(|| {
        let on_escape = signal.clone();
        let stop = Arc::clone(&stop_reader);
        // Reading stdin blocks, so this lives on its own thread.
        std::thread::spawn(move || watch_escape(std::io::stdin(), &on_escape, &stop))
    });

    CancelGuard {
        tasks,
        stop_reader,
        reader,
        raw_terminal,
    }
}

/// Toggle canonical mode via `stty`. Returns whether the call succeeded.
fn set_terminal_canonical(canonical: bool) -> bool {
    let args: &[&str] = if canonical {
        &["icanon", "echo"]
    } else {
        // Reads return after at most 100ms, so the escape watcher can tell a
        // lone ESC from a sequence and notice when it should stop.
        &["-icanon", "-echo", "min", "0", "time", "1"]
    };
    std::process::Command::new("stty")
        .args(args)
        .stdin(std::process::Stdio::inherit())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields one scripted burst per read, then quiet reads after raising
    /// `stop` so the watcher winds down.
    struct Keys {
        bursts: VecDeque<Vec<u8>>,
        stop: Arc<AtomicBool>,
    }

    impl Read for Keys {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.bursts.pop_front() {
                Some(burst) => {
                    buf[..burst.len()].copy_from_slice(&burst);
                    Ok(burst.len())
                }
                None => {
                    self.stop.store(true, Ordering::SeqCst);
                    Ok(0)
                }
            }
        }
    }

    fn press(bursts: &[&[u8]]) -> bool {
        let stop = Arc::new(AtomicBool::new(false));
        let keys = Keys {
            bursts: bursts.iter().map(|b| b.to_vec()).collect(),
            stop: Arc::clone(&stop),
        };
        let signal = CancelSignal::new();
        watch_escape(keys, &signal, &stop);
        signal.is_cancelled()
    }

    #[test]
    fn only_lone_escape_cancels() {
        assert!(press(&[b"\x1b"]));
        assert!(press(&[b"a", b"\x1b"]));
        assert!(!press(&[b"\x1b[A"]));
        assert!(!press(&[b"\x1b", b"[B"]));
        assert!(!press(&[b"q"]));
    }

    #[test]
    fn watcher_stops_when_asked() {
        let stop = AtomicBool::new(true);
        let signal = CancelSignal::new();
        watch_escape(&b"\x1b"[..], &signal, &stop);
        assert!(!signal.is_cancelled());
    }
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn normalize_policy() {
        assert_eq!(
            normalize_concurrency(None),
            ConcurrencySetting {
                value: 4,
                warning: None
            }
        );

        let capped = normalize_concurrency(Some(99.0));
        assert_eq!(capped.value, 10);
        assert!(capped.warning.unwrap().starts_with("capped"));

        let zero = normalize_concurrency(Some(0.0));
        assert_eq!(zero.value, 4);
        assert!(zero.warning.unwrap().starts_with("must be >= 1"));

        assert_eq!(normalize_concurrency(Some(-3.0)).value, 4);
        assert_eq!(normalize_concurrency(Some(f64::NAN)).value, 4);
        assert_eq!(normalize_concurrency(Some(f64::INFINITY)).value, 4);

        let low = normalize_concurrency(Some(0.5));
        assert_eq!(low.value, 1);
        assert!(low.warning.is_some());

        let frac = normalize_concurrency(Some(3.7));
        assert_eq!(frac.value, 3);
        assert!(frac.warning.unwrap().starts_with("rounded down"));

        assert_eq!(normalize_concurrency(Some(7.0)).warning, None);
    }

    #[test]
    fn parse_text_input() {
        assert_eq!(parse_concurrency(""), None);
        assert_eq!(parse_concurrency(" 6 "), Some(6.0));
        assert!(parse_concurrency("lots").unwrap().is_nan());
    }

    #[tokio::test]
    async fn never_exceeds_limit_and_yields_all() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<u64> = (0..20).collect();

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let mut rx = run_with_concurrency(items, 3, CancelSignal::new(), move |i| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                // Later items finish first to exercise completion order.
                tokio::time::sleep(Duration::from_millis(20 - i)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                i
            }
        });

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(results.len(), 20);
        results.sort();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn yields_in_completion_order() {
        let mut rx = run_with_concurrency(vec![60u64, 5], 2, CancelSignal::new(), |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms
        });
        assert_eq!(rx.recv().await, Some(5));
        assert_eq!(rx.recv().await, Some(60));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancellation_stops_scheduling() {
        let cancel = CancelSignal::new();
        let started = Arc::new(AtomicUsize::new(0));

        let (c, s) = (cancel.clone(), Arc::clone(&started));
        let mut rx = run_with_concurrency((0..50).collect::<Vec<u32>>(), 2, cancel.clone(), move |i| {
            let (c, s) = (c.clone(), Arc::clone(&s));
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    c.cancel();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                i
            }
        });

        let mut finished = 0;
        while rx.recv().await.is_some() {
            finished += 1;
        }
        assert!(cancel.is_cancelled());
        // Every started item still completes; nothing new starts after cancel.
        assert_eq!(finished, started.load(Ordering::SeqCst));
        assert!(finished < 50);
    }

    #[tokio::test]
    async fn zero_limit_is_clamped() {
        let mut rx = run_with_concurrency(vec![1, 2, 3], 0, CancelSignal::new(), |i| async move { i });
        let mut n = 0;
        while rx.recv().await.is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
    }
}
