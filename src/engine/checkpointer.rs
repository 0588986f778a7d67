//! Background checkpoint task.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::run::RunHandle;
use super::state::EngineState;

impl RunHandle {
    /// Checkpoint off the item path: every `interval_secs` while items are
    /// flowing, and as soon as `every_items` have been marked. Every
    /// `verify_every` committed cycles it also runs the key-derivation
    /// self-check. Stops when the run finalizes or shuts down.
    pub fn spawn_checkpointer(&self) -> JoinHandle<()> {
        let handle = self.clone();
        let mut stop = self.shared.stop.subscribe();
        let period = self.shared.settings.interval();
        let verify_every = self.shared.settings.verify_every;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            let mut committed: u64 = 0;

            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = handle.shared.trigger.notified() => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                match handle.state() {
                    EngineState::Closed | EngineState::Failed => break,
                    _ if handle.pending() == 0 => continue,
                    _ => {}
                }
                // failures are logged by the commit and retried next cycle
                if let Err(e) = handle.checkpoint().await {
                    log::debug!("Background checkpoint for {} skipped: {}", handle.job_id(), e);
                    continue;
                }
                committed += 1;
                if verify_every > 0 && committed % verify_every == 0 {
                    if let Err(e) = handle.verify_output_sample().await {
                        log::warn!("Self-check for {} could not run: {}", handle.job_id(), e);
                    }
                }
            }
            log::debug!("Checkpointer for {} stopped", handle.job_id());
        })
    }
}
