/*!
In-flight command state shared between the caller and the retry machinery.
*/
use crate::resp::{CommandArgs, Reply};
use log::{debug, warn};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

/// Per-command routing and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandControl {
    /// Budget of a single attempt
    pub timeout_single: Duration,
    /// Absolute budget across every retry of the command
    pub timeout_all: Duration,
    pub max_retries: usize,
    /// Retry a nil reply from a replica against the master
    pub force_retries_to_master_on_nil_reply: bool,
}

impl Default for CommandControl {
    fn default() -> Self {
        Self {
            timeout_single: Duration::from_millis(500),
            timeout_all: Duration::from_secs(2),
            max_retries: 4,
            force_retries_to_master_on_nil_reply: false,
        }
    }
}

impl fmt::Display for CommandControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "timeout_single={}ms timeout_all={}ms max_retries={}",
            self.timeout_single.as_millis(),
            self.timeout_all.as_millis(),
            self.max_retries
        ))
    }
}

pub type CommandPtr = Arc<Command>;
pub type ReplyCallback = Arc<dyn Fn(&CommandPtr, Reply) + Send + Sync>;

/// One logical command with its reply callback and redirect metadata.
///
/// The same `Command` is referenced by every pending attempt's
/// continuation; `counter` stamps the attempt generation so a stale reply
/// (one raced by a redirect) can be recognized and dropped.
pub struct Command {
    pub args: CommandArgs,
    callback: ReplyCallback,
    pub control: CommandControl,
    counter: AtomicUsize,
    /// The attempt must be preceded by `ASKING` on the wire
    pub asking: bool,
    /// This command was spawned by a MOVED/ASK reply to an earlier attempt
    pub redirected: bool,
    instance_idx: AtomicUsize,
    invoke_counter: AtomicUsize,
}

impl Command {
    pub fn new(args: CommandArgs, callback: ReplyCallback, control: CommandControl) -> CommandPtr {
        Self::with_state(args, callback, control, 0, false, 0, false)
    }

    pub fn with_state(
        args: CommandArgs,
        callback: ReplyCallback,
        control: CommandControl,
        counter: usize,
        asking: bool,
        prev_instance_idx: usize,
        redirected: bool,
    ) -> CommandPtr {
        Arc::new(Command {
            args,
            callback,
            control,
            counter: AtomicUsize::new(counter),
            asking,
            redirected,
            instance_idx: AtomicUsize::new(prev_instance_idx),
            invoke_counter: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> String {
        self.args.command_name()
    }

    pub fn counter(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Invalidates every reply still in flight for the previous generation.
    pub fn bump_counter(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn instance_idx(&self) -> usize {
        self.instance_idx.load(Ordering::Relaxed)
    }

    pub fn set_instance_idx(&self, idx: usize) {
        self.instance_idx.store(idx, Ordering::Relaxed);
    }

    pub fn invoke_count(&self) -> usize {
        self.invoke_counter.load(Ordering::SeqCst)
    }

    pub fn callback(&self) -> ReplyCallback {
        self.callback.clone()
    }

    /// Delivers a reply to the command's callback.
    pub fn complete(command: &CommandPtr, reply: Reply) {
        (command.callback.clone())(command, reply);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("args", &self.args)
            .field("control", &self.control)
            .field("counter", &self.counter)
            .field("asking", &self.asking)
            .field("redirected", &self.redirected)
            .finish()
    }
}

/// Unit of work in the deferred submission queue.
#[derive(Debug, Clone)]
pub struct SentinelCommand {
    pub command: CommandPtr,
    pub master_required: bool,
    pub shard: usize,
    pub start: Instant,
}

impl SentinelCommand {
    pub fn new(command: CommandPtr, master_required: bool, shard: usize, start: Instant) -> Self {
        Self {
            command,
            master_required,
            shard,
            start,
        }
    }
}

/// Final delivery of a reply to the user callback.
///
/// A panicking callback is logged and contained; it never unwinds into the
/// command path.
pub fn invoke_command(command: &CommandPtr, reply: Reply) {
    let request_str = if command.args.chunk_count() > 1 {
        format!(
            "subrequest idx={}, cmd={}",
            command.invoke_count(),
            command.name()
        )
    } else {
        command.args.to_string()
    };
    debug!(
        "redis_request( {request_str} ):{}:{:?} cc: {}",
        if reply.is_ok() { '+' } else { '-' },
        reply.time,
        command.control,
    );
    command.invoke_counter.fetch_add(1, Ordering::SeqCst);
    let cmd_name = reply.cmd.clone();
    let callback = command.callback.clone();
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| callback(command, reply)));
    if delivered.is_err() {
        warn!("panic in command callback, cmd={cmd_name}");
    }
}
