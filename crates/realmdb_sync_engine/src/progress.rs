//! Upload and download progress notifications.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which transfer a progress notifier follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressDirection {
    /// Local changes going to the server.
    Upload,
    /// Server changes coming in.
    Download,
}

/// A progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Bytes transferred.
    pub transferred: u64,
    /// Bytes to transfer in total.
    pub transferrable: u64,
    /// `transferred / transferrable`, 1.0 when nothing is left.
    pub estimate: f64,
}

impl Progress {
    pub(crate) fn new(transferred: u64, transferrable: u64) -> Self {
        let estimate = if transferrable == 0 {
            1.0
        } else {
            (transferred as f64 / transferrable as f64).min(1.0)
        };
        Self {
            transferred,
            transferrable,
            estimate,
        }
    }

    /// Whether everything known has been transferred.
    pub fn is_complete(&self) -> bool {
        self.transferred >= self.transferrable
    }
}

/// Receives progress reports.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

struct Notifier {
    direction: ProgressDirection,
    streaming: bool,
    callback: ProgressCallback,
    ceiling: Option<u64>,
}

#[derive(Default)]
struct State {
    notifiers: BTreeMap<u64, Notifier>,
    upload: Option<(u64, u64)>,
    download: Option<(u64, u64)>,
    next_token: u64,
}

impl State {
    fn current(&self, direction: ProgressDirection) -> Option<(u64, u64)> {
        match direction {
            ProgressDirection::Upload => self.upload,
            ProgressDirection::Download => self.download,
        }
    }

    /// Reports for `direction`, removing finished one-shot notifiers.
    fn collect(&mut self, direction: ProgressDirection, only: Option<u64>) -> Vec<(ProgressCallback, Progress)> {
        let Some((transferred, transferrable)) = self.current(direction) else {
            return Vec::new();
        };
        let mut calls = Vec::new();
        let mut finished = Vec::new();
        for (token, notifier) in &mut self.notifiers {
            if notifier.direction != direction || only.is_some_and(|t| t != *token) {
                continue;
            }
            if notifier.streaming {
                calls.push((Arc::clone(&notifier.callback), Progress::new(transferred, transferrable)));
            } else {
                let ceiling = *notifier.ceiling.get_or_insert(transferrable);
                let progress = Progress::new(transferred.min(ceiling), ceiling);
                if progress.is_complete() {
                    finished.push(*token);
                }
                calls.push((Arc::clone(&notifier.callback), progress));
            }
        }
        for token in finished {
            self.notifiers.remove(&token);
        }
        calls
    }
}

/// The progress notifiers of one session.
///
/// Streaming notifiers follow every change. Non-streaming notifiers fix
/// the total when they first report and are removed once it is reached.
/// Callbacks run outside the lock.
#[derive(Default)]
pub(crate) struct ProgressNotifiers {
    state: Mutex<State>,
}

impl ProgressNotifiers {
    pub fn register(&self, direction: ProgressDirection, streaming: bool, callback: ProgressCallback) -> u64 {
        let (token, calls) = {
            let mut state = self.state.lock();
            state.next_token += 1;
            let token = state.next_token;
            state.notifiers.insert(
                token,
                Notifier {
                    direction,
                    streaming,
                    callback,
                    ceiling: None,
                },
            );
            (token, state.collect(direction, Some(token)))
        };
        run(calls);
        token
    }

    pub fn unregister(&self, token: u64) {
        self.state.lock().notifiers.remove(&token);
    }

    pub fn update(&self, direction: ProgressDirection, transferred: u64, transferrable: u64) {
        let calls = {
            let mut state = self.state.lock();
            let value = Some((transferred, transferrable.max(transferred)));
            let slot = match direction {
                ProgressDirection::Upload => &mut state.upload,
                ProgressDirection::Download => &mut state.download,
            };
            if *slot == value {
                return;
            }
            *slot = value;
            state.collect(direction, None)
        };
        run(calls);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().notifiers.len()
    }
}

fn run(calls: Vec<(ProgressCallback, Progress)>) {
    for (callback, progress) in calls {
        callback(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<(u64, u64)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |p: Progress| sink.lock().push((p.transferred, p.transferrable)));
        (callback, seen)
    }

    #[test]
    fn streaming_notifiers_see_every_update() {
        let notifiers = ProgressNotifiers::default();
        let (callback, seen) = recorder();
        notifiers.register(ProgressDirection::Download, true, callback);
        notifiers.update(ProgressDirection::Download, 0, 100);
        notifiers.update(ProgressDirection::Upload, 5, 5);
        notifiers.update(ProgressDirection::Download, 100, 150);
        notifiers.update(ProgressDirection::Download, 150, 150);
        assert_eq!(*seen.lock(), vec![(0, 100), (100, 150), (150, 150)]);
        assert_eq!(notifiers.len(), 1);
    }

    #[test]
    fn one_shot_notifiers_fix_their_total() {
        let notifiers = ProgressNotifiers::default();
        notifiers.update(ProgressDirection::Upload, 10, 40);
        let (callback, seen) = recorder();
        notifiers.register(ProgressDirection::Upload, false, callback);
        notifiers.update(ProgressDirection::Upload, 20, 90);
        notifiers.update(ProgressDirection::Upload, 60, 90);
        notifiers.update(ProgressDirection::Upload, 90, 90);
        assert_eq!(*seen.lock(), vec![(10, 40), (20, 40), (40, 40)]);
        assert_eq!(notifiers.len(), 0);
    }

    #[test]
    fn unregistered_notifiers_stay_quiet() {
        let notifiers = ProgressNotifiers::default();
        let (callback, seen) = recorder();
        let token = notifiers.register(ProgressDirection::Download, true, callback);
        notifiers.unregister(token);
        notifiers.update(ProgressDirection::Download, 1, 2);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn estimates() {
        assert_eq!(Progress::new(0, 0).estimate, 1.0);
        assert_eq!(Progress::new(5, 10).estimate, 0.5);
        assert!(!Progress::new(5, 10).is_complete());
    }
}
