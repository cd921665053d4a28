//! Scripts: what a call runs. A plain item, a pipeline of messages sent one
//! after another, or a repeater that runs another script in a loop.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lumen_core::{Message, Payload, Target};
use tokio::time::{sleep_until, Instant};

use crate::catcher::{CatchScope, ErrorCatcher};
use crate::error::DispatchError;
use crate::item::{Item, ReplyStream, ReplyTx};
use crate::options::{Broadcast, SendOptions};
use crate::reference::Reference;
use crate::sender::Sender;

#[derive(Debug, Clone)]
pub enum Script {
    Item(Item),
    Pipeline(Pipeline),
    Repeater(Repeater),
}

impl Script {
    pub fn run(&self, reference: Reference, sender: &Sender, options: SendOptions) -> ReplyStream {
        match self {
            Script::Item(item) => item.run(reference, sender, options),
            Script::Pipeline(pipeline) => pipeline.run(reference, sender, options),
            Script::Repeater(repeater) => repeater.run(reference, sender, options),
        }
    }
}

impl From<Item> for Script {
    fn from(item: Item) -> Self {
        Script::Item(item)
    }
}

impl From<Message> for Script {
    fn from(msg: Message) -> Self {
        Script::Item(Item::new(vec![msg]))
    }
}

impl From<Payload> for Script {
    fn from(payload: Payload) -> Self {
        Message::new(payload).into()
    }
}

impl From<Vec<Message>> for Script {
    fn from(parts: Vec<Message>) -> Self {
        Script::Item(Item::new(parts))
    }
}

impl From<Pipeline> for Script {
    fn from(pipeline: Pipeline) -> Self {
        Script::Pipeline(pipeline)
    }
}

impl From<Repeater> for Script {
    fn from(repeater: Repeater) -> Self {
        Script::Repeater(repeater)
    }
}

/// Catcher for a nested call: forwards into `scope` and notes that something
/// went wrong.
fn flagging(scope: &CatchScope, failed: &Arc<AtomicBool>) -> ErrorCatcher {
    let scope = scope.clone();
    let failed = failed.clone();
    ErrorCatcher::callback(move |e| {
        failed.store(true, Ordering::SeqCst);
        scope.add(e);
    })
}

/// Pass replies on. `false` once the consumer has gone.
async fn forward(mut stream: ReplyStream, tx: &ReplyTx) -> bool {
    while let Some(item) = stream.next().await {
        if tx.send(item).await.is_err() {
            return false;
        }
    }
    true
}

/// Messages sent one at a time, each waiting for the previous one.
#[derive(Debug, Clone)]
pub struct Pipeline {
    messages: Vec<Message>,
    /// Pause between consecutive messages.
    pub spread: Duration,
    /// Stop a device's sequence at its first error.
    pub short_circuit_on_error: bool,
    /// Send each message to every device before moving to the next, instead
    /// of letting each device progress on its own.
    pub synchronized: bool,
}

impl Pipeline {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            spread: Duration::ZERO,
            short_circuit_on_error: false,
            synchronized: false,
        }
    }

    pub fn spread(mut self, spread: Duration) -> Self {
        self.spread = spread;
        self
    }

    pub fn short_circuit_on_error(mut self, on: bool) -> Self {
        self.short_circuit_on_error = on;
        self
    }

    pub fn synchronized(mut self, on: bool) -> Self {
        self.synchronized = on;
        self
    }

    pub fn run(&self, reference: Reference, sender: &Sender, options: SendOptions) -> ReplyStream {
        let pipeline = self.clone();
        let sender = sender.clone();
        ReplyStream::spawn(move |tx| async move {
            let scope = CatchScope::new(options.error_catcher.clone());
            let targets = if pipeline.synchronized {
                pipeline
                    .run_sequence(reference, &sender, &options, &scope, &tx)
                    .await;
                0
            } else {
                match pipeline.run_per_device(reference, &sender, &options, &scope, &tx).await {
                    Ok(n) => n,
                    Err(e) => {
                        scope.add(e);
                        0
                    }
                }
            };
            scope.finish(targets)
        })
    }

    /// Send every message in order to `reference`. Returns false when the
    /// consumer has gone.
    async fn run_sequence(
        &self,
        reference: Reference,
        sender: &Sender,
        options: &SendOptions,
        scope: &CatchScope,
        tx: &ReplyTx,
    ) -> bool {
        let failed = Arc::new(AtomicBool::new(false));
        for (i, msg) in self.messages.iter().enumerate() {
            if i > 0 && !self.spread.is_zero() {
                tokio::time::sleep(self.spread).await;
            }
            let opts = options.clone().error_catcher(flagging(scope, &failed));
            let stream = Item::new(vec![msg.clone()]).run(reference.clone(), sender, opts);
            if !forward(stream, tx).await {
                return false;
            }
            if self.short_circuit_on_error && failed.load(Ordering::SeqCst) {
                break;
            }
        }
        true
    }

    async fn run_per_device(
        &self,
        reference: Reference,
        sender: &Sender,
        options: &SendOptions,
        scope: &CatchScope,
        tx: &ReplyTx,
    ) -> Result<usize, DispatchError> {
        let (_, serials, _) = reference
            .resolve(sender, options.found.clone(), options.find_timeout, options.broadcast)
            .await?;
        let runs = serials.iter().map(|serial| {
            let reference = Reference::Serials(vec![*serial]);
            self.run_sequence(reference, sender, options, scope, tx)
        });
        futures::future::join_all(runs).await;
        Ok(serials.len())
    }
}

type OnDoneLoop = Arc<dyn Fn() -> ControlFlow<()> + Send + Sync>;

/// Runs a script again and again. Special references are reset between
/// loops so every loop sees the current set of devices.
#[derive(Clone)]
pub struct Repeater {
    script: Box<Script>,
    /// A loop that finishes early waits out the rest of this.
    pub min_loop_time: Duration,
    on_done_loop: Option<OnDoneLoop>,
}

impl Repeater {
    pub fn new(script: impl Into<Script>) -> Self {
        Self {
            script: Box::new(script.into()),
            min_loop_time: Duration::from_secs(30),
            on_done_loop: None,
        }
    }

    pub fn min_loop_time(mut self, min: Duration) -> Self {
        self.min_loop_time = min;
        self
    }

    /// Called after every loop; `Break` stops repeating.
    pub fn on_done_loop(mut self, f: impl Fn() -> ControlFlow<()> + Send + Sync + 'static) -> Self {
        self.on_done_loop = Some(Arc::new(f));
        self
    }

    pub fn run(&self, reference: Reference, sender: &Sender, options: SendOptions) -> ReplyStream {
        let repeater = self.clone();
        let sender = sender.clone();
        ReplyStream::spawn(move |tx| async move {
            let scope = CatchScope::new(options.error_catcher.clone());
            repeater.run_loops(reference, &sender, &options, &scope, &tx).await;
            scope.finish(0)
        })
    }

    async fn run_loops(
        &self,
        reference: Reference,
        sender: &Sender,
        options: &SendOptions,
        scope: &CatchScope,
        tx: &ReplyTx,
    ) {
        loop {
            let started = Instant::now();
            let opts = options.clone().error_catcher(scope.forwarder());
            let stream = self.script.run(reference.clone(), sender, opts);
            if !forward(stream, tx).await {
                return;
            }
            reference.reset();
            if let Some(done) = &self.on_done_loop {
                if done().is_break() {
                    return;
                }
            }
            sleep_until(started + self.min_loop_time).await;
        }
    }
}

impl fmt::Debug for Repeater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repeater")
            .field("script", &self.script)
            .field("min_loop_time", &self.min_loop_time)
            .finish()
    }
}

/// Serials a reference resolves to, and those it could not find.
pub async fn find_serials(
    reference: &Reference,
    sender: &Sender,
    timeout: Duration,
) -> Result<(Vec<Target>, Vec<Target>), DispatchError> {
    let (_, serials, missing) = reference
        .resolve(sender, None, timeout, Broadcast::Off)
        .await?;
    let missing = missing.unwrap_or_default();
    let serials = serials.into_iter().filter(|s| !missing.contains(s)).collect();
    Ok((serials, missing))
}
