//! Cooperative pause/stop control.
//!
//! Two sentinel files under the control dir drive every blocking point:
//! `PAUSE` parks the stages in a sleep-poll loop, `STOP` (or the in-process
//! stop flag) makes them drain and exit. SIGINT maps onto the same files:
//! first interrupt pauses, a second within the window (or any interrupt
//! while paused) stops. A stdin listener gives the same two controls
//! interactively.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::now_ts;

pub const PAUSE_FILE: &str = "PAUSE";
pub const STOP_FILE: &str = "STOP";

pub struct Controls {
    control_dir: PathBuf,
    idle_sleep: Duration,
    stop: AtomicBool,
}

impl Controls {
    pub fn new(cfg: &Config) -> Arc<Self> {
        let control_dir = cfg
            .control_dir
            .clone()
            .unwrap_or_else(|| cfg.save_dir.clone());
        let _ = std::fs::create_dir_all(&control_dir);
        Arc::new(Self {
            control_dir,
            idle_sleep: Duration::from_secs_f64(cfg.idle_sleep_secs.max(0.1)),
            stop: AtomicBool::new(false),
        })
    }

    /// Sentinel path, confined to the control dir: any directory components
    /// in `name` are discarded.
    fn control_path(&self, name: &str) -> PathBuf {
        let base = Path::new(name)
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| std::ffi::OsString::from(STOP_FILE));
        self.control_dir.join(base)
    }

    pub fn pause_path(&self) -> PathBuf {
        self.control_path(PAUSE_FILE)
    }

    pub fn stop_path(&self) -> PathBuf {
        self.control_path(STOP_FILE)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_path().exists()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.stop_path().exists()
    }

    /// Create STOP and raise the in-process flag.
    pub fn request_stop(&self) {
        let p = self.stop_path();
        if let Some(parent) = p.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&p);
        self.stop.store(true, Ordering::Relaxed);
        tracing::info!("stop requested | stop_file={}", p.display());
    }

    /// Create or remove PAUSE. Returns the new paused state.
    pub fn set_paused(&self, paused: bool) -> bool {
        let p = self.pause_path();
        if paused {
            if let Some(parent) = p.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::OpenOptions::new().create(true).append(true).open(&p);
        } else if p.exists() {
            let _ = std::fs::remove_file(&p);
        }
        paused
    }

    pub fn idle_sleep(&self) {
        std::thread::sleep(self.idle_sleep);
    }

    /// Park while paused (and not stopping).
    pub fn wait_if_paused(&self) {
        while !self.stop_requested() && self.pause_requested() {
            self.idle_sleep();
        }
    }

    /// The gate every blocking point passes through: false means drain and
    /// exit, true means continue (after any pause).
    pub fn gate(&self) -> bool {
        if self.stop_requested() {
            return false;
        }
        self.wait_if_paused();
        !self.stop_requested()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigintAction {
    Paused,
    Stopped,
}

/// The two-step interrupt state machine.
pub struct SigintState {
    window_secs: f64,
    last: Mutex<f64>,
}

impl SigintState {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window_secs,
            last: Mutex::new(0.0),
        }
    }

    /// Decide what this interrupt means and apply it to the controls.
    pub fn on_interrupt_at(&self, controls: &Controls, now: f64) -> SigintAction {
        let mut last = self.last.lock().unwrap();
        let prev = *last;
        *last = now;
        if controls.pause_requested() || (now - prev) <= self.window_secs {
            controls.request_stop();
            SigintAction::Stopped
        } else {
            controls.set_paused(true);
            tracing::info!(
                "interrupt: paused | pause_file={} | interrupt again within {:.0}s to stop",
                controls.pause_path().display(),
                self.window_secs
            );
            SigintAction::Paused
        }
    }

    pub fn on_interrupt(&self, controls: &Controls) -> SigintAction {
        self.on_interrupt_at(controls, now_ts())
    }
}

/// Watch SIGINT for the lifetime of the run; exits after a stop.
pub fn spawn_signal_task(
    controls: Arc<Controls>,
    sigint: Arc<SigintState>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if sigint.on_interrupt(&controls) == SigintAction::Stopped {
                return;
            }
        }
    })
}

/// Interactive controls on stdin: `p` toggles pause, `q` stops. Runs on a
/// plain thread so a blocked read never holds up shutdown; the thread is
/// detached and dies with the process.
pub fn spawn_stdin_listener(controls: Arc<Controls>) {
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { return };
            match line.trim().to_ascii_lowercase().as_str() {
                "p" => {
                    let paused = controls.pause_requested();
                    controls.set_paused(!paused);
                    tracing::info!("{}", if paused { "resume requested" } else { "pause requested" });
                }
                "q" => {
                    controls.request_stop();
                    return;
                }
                _ => {}
            }
            if controls.stop_requested() {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controls_in(dir: &Path) -> Arc<Controls> {
        let mut cfg = Config::default();
        cfg.save_dir = dir.to_path_buf();
        cfg.control_dir = Some(dir.to_path_buf());
        cfg.idle_sleep_secs = 0.1;
        Controls::new(&cfg)
    }

    #[test]
    fn stop_file_and_flag_both_gate() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = controls_in(dir.path());
        assert!(c.gate());
        std::fs::write(c.stop_path(), b"").unwrap();
        assert!(c.stop_requested());
        assert!(!c.gate());
    }

    #[test]
    fn pause_file_toggles() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = controls_in(dir.path());
        c.set_paused(true);
        assert!(c.pause_requested());
        c.set_paused(false);
        assert!(!c.pause_requested());
    }

    #[test]
    fn control_paths_are_confined_to_the_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = controls_in(dir.path());
        let p = c.control_path("../../etc/evil");
        assert_eq!(p, dir.path().join("evil"));
    }

    #[test]
    fn first_interrupt_pauses_second_stops() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = controls_in(dir.path());
        let s = SigintState::new(3.0);
        assert_eq!(s.on_interrupt_at(&c, 100.0), SigintAction::Paused);
        assert!(c.pause_requested());
        assert!(!c.stop_requested());
        assert_eq!(s.on_interrupt_at(&c, 102.0), SigintAction::Stopped);
        assert!(c.stop_requested());
    }

    #[test]
    fn interrupt_while_paused_stops_even_outside_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = controls_in(dir.path());
        c.set_paused(true);
        let s = SigintState::new(3.0);
        assert_eq!(s.on_interrupt_at(&c, 100.0), SigintAction::Stopped);
    }

    #[test]
    fn spaced_interrupts_only_pause() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = controls_in(dir.path());
        let s = SigintState::new(3.0);
        assert_eq!(s.on_interrupt_at(&c, 100.0), SigintAction::Paused);
        // Clear the pause, as an operator resuming would.
        c.set_paused(false);
        assert_eq!(s.on_interrupt_at(&c, 200.0), SigintAction::Paused);
    }
}
