//! Small task pool for replication work that must not block the caller.
//!
//! One worker per pool is enough here: tasks for a single replica must run
//! in submission order (finalize before the next recovery step), and each
//! replica owns its own pool.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

#[derive(Debug)]
pub struct ThreadPool {
    sender: Sender<Message>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Message>();
        let thread_name = format!("lamina-{name}");
        let worker = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Run(task) => task(),
                        Message::Shutdown => break,
                    }
                }
            })
            .unwrap_or_else(|err| panic!("failed to spawn {thread_name}: {err}"));
        Self {
            sender,
            worker: Some(worker),
        }
    }

    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) {
        if self.sender.send(Message::Run(Box::new(task))).is_err() {
            warn!("task pool worker is gone, dropping task");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            // A task can hold the last reference to the pool's owner, in
            // which case this drop runs on the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
