//! Timer driver for one session generation.
//!
//! A single task owns the poll, rotation, and countdown intervals so the
//! whole timer set can be cancelled with one abort.

use crate::controller::Core;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Display countdown resolution.
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

enum DriverCommand {
    /// Restart the rotation period and the countdown second from now.
    ResetRotation,
}

/// Handle to a running timer driver.
pub(crate) struct Driver {
    task: JoinHandle<()>,
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl Driver {
    /// Spawn the driver for `generation`. First ticks fire one period from now.
    pub(crate) fn spawn(runtime: &Handle, core: Core, generation: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run(core, generation, rx));
        Self { task, commands: tx }
    }

    pub(crate) fn reset_rotation(&self) {
        if self.commands.send(DriverCommand::ResetRotation).is_err() {
            debug!("link: timer driver already gone, rotation reset dropped");
        }
    }

    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

async fn run(core: Core, generation: u64, mut commands: mpsc::UnboundedReceiver<DriverCommand>) {
    let config = core.config();
    let now = Instant::now();
    let mut poll = interval_at(now + config.poll_interval(), config.poll_interval());
    let mut rotation = interval_at(now + config.rotation_period(), config.rotation_period());
    let mut countdown = interval_at(now + COUNTDOWN_TICK, COUNTDOWN_TICK);
    for timer in [&mut poll, &mut rotation, &mut countdown] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        let current = tokio::select! {
            _ = poll.tick() => core.on_poll_tick(generation),
            _ = rotation.tick() => core.on_rotation_tick(generation),
            _ = countdown.tick() => core.on_countdown_tick(generation),
            command = commands.recv() => match command {
                Some(DriverCommand::ResetRotation) => {
                    rotation.reset();
                    countdown.reset();
                    true
                }
                None => false,
            },
        };
        if !current {
            debug!("link: timer driver for generation {generation} retired");
            break;
        }
    }
}

/// Next countdown value. Wraps back to the full period instead of reaching zero.
pub(crate) fn next_countdown(current: u32, period: u32) -> u32 {
    if current <= 1 {
        period
    } else {
        current - 1
    }
}
