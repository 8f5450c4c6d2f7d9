//! The run queue: a single cooperative processor for everything that
//! mutates ratchet state.
//!
//! API entry points enqueue a [`Command`] and return; the worker thread
//! drains the queue one item at a time, so there is never more than one
//! in-flight mutation per local user. Processing a command may fan out into
//! follow-up commands (a decrypted message becomes a temp-delivery item;
//! a retry sweep re-enqueues everything durable), which are appended in
//! order.
//!
//! With `inline_processing` enabled the queue runs items on the caller's
//! thread instead — deterministic, used by the test suite.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::api::Core;
use crate::send::SendItem;

pub(crate) enum Command {
    SendMessage(Box<SendItem>),
    ReceivedRawData {
        sequence: i64,
        data: String,
        sender: String,
        display_name: String,
    },
    ReceivedTempMsg {
        sequence: i64,
        descriptor: String,
        supplement: String,
        msg_type: i32,
    },
    CheckForRetry,
}

#[derive(Default)]
struct QueueState {
    items: Mutex<VecDeque<Command>>,
    available: Condvar,
    stopped: Mutex<bool>,
}

pub(crate) struct RunQueue {
    core: Arc<Core>,
    state: Arc<QueueState>,
    inline: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RunQueue {
    pub(crate) fn start(core: Arc<Core>, inline: bool) -> Self {
        let state = Arc::new(QueueState::default());
        let worker = if inline {
            None
        } else {
            let core = Arc::clone(&core);
            let state = Arc::clone(&state);
            Some(std::thread::spawn(move || run_loop(core, state)))
        };
        Self { core, state, inline, worker: Mutex::new(worker) }
    }

    pub(crate) fn enqueue(&self, command: Command) {
        if self.inline {
            let mut pending = VecDeque::from([command]);
            while let Some(next) = pending.pop_front() {
                pending.extend(process_one(&self.core, next));
            }
            return;
        }
        let mut items = self.state.items.lock();
        items.push_back(command);
        self.state.available.notify_one();
    }

    /// Stop the worker after the current item. Idempotent.
    pub(crate) fn stop(&self) {
        *self.state.stopped.lock() = true;
        self.state.available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(core: Arc<Core>, state: Arc<QueueState>) {
    loop {
        let command = {
            let mut items = state.items.lock();
            loop {
                if *state.stopped.lock() {
                    return;
                }
                if let Some(command) = items.pop_front() {
                    break command;
                }
                state.available.wait(&mut items);
            }
        };
        for follow_up in process_one(&core, command) {
            state.items.lock().push_back(follow_up);
        }
    }
}

/// Dispatch one command; returns follow-up commands to append.
fn process_one(core: &Core, command: Command) -> Vec<Command> {
    match command {
        Command::SendMessage(item) => {
            let msg_id = item.msg_id.clone();
            let device_id = item.device_id.clone();
            let recipient = item.recipient.clone();
            let transport_id = item.transport_id;
            if let Err(err) = crate::send::process_send(core, *item) {
                error!(%recipient, %device_id, code = err.code(), "send failed: {err}");
                core.callbacks.state_report(
                    transport_id,
                    err.code(),
                    &crate::descriptor::send_error_json(
                        &recipient,
                        &device_id,
                        &msg_id,
                        err.code(),
                    ),
                );
            }
            Vec::new()
        }
        Command::ReceivedRawData { sequence, data, sender, display_name } => {
            match crate::receive::process_raw(core, sequence, &data, &sender, &display_name) {
                Ok(follow_ups) => follow_ups,
                Err(err) => {
                    // Transient failure: the raw record stays queued and the
                    // next retry sweep picks it up again.
                    error!(sequence, code = err.code(), "raw processing failed: {err}");
                    Vec::new()
                }
            }
        }
        Command::ReceivedTempMsg { sequence, descriptor, supplement, msg_type } => {
            crate::receive::process_temp(core, sequence, &descriptor, &supplement, msg_type);
            Vec::new()
        }
        Command::CheckForRetry => {
            debug!("retry sweep");
            crate::receive::check_for_retry(core)
        }
    }
}
