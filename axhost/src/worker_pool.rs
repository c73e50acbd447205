// SPDX-License-Identifier: GPL-3.0-or-later

//! A small fixed pool of worker threads for event delivery.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: Mutex<Sender<Job>>,
    size: usize,
}

static SHARED: OnceLock<WorkerPool> = OnceLock::new();

impl WorkerPool {
    /// The process-wide pool, created on first use and never torn down.
    pub(crate) fn shared() -> &'static WorkerPool {
        SHARED.get_or_init(|| {
            let size = thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4)
                .max(2);
            WorkerPool::new("axhost-sink", size)
        })
    }

    pub(crate) fn new(name: &str, size: usize) -> WorkerPool {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut spawned = 0;
        for index in 0..size {
            let receiver = receiver.clone();
            match thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || work(&receiver))
            {
                Ok(_) => spawned += 1,
                Err(error) => log::error!("unable to start worker thread: {error}"),
            }
        }
        WorkerPool {
            sender: Mutex::new(sender),
            size: spawned,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        sender.send(Box::new(job)).is_ok()
    }
}

fn work(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
