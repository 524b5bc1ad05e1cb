use bytes::Bytes;
use smallvec::{SmallVec, smallvec};
use std::fmt;

/// One wire command: name followed by its arguments.
pub type ArgChunk = SmallVec<[Bytes; 6]>;

/// Shortcut function for creating a single-chunk command.
#[must_use]
#[inline(always)]
pub fn cmd(name: &'static str) -> CommandArgs {
    CommandArgs {
        chunks: smallvec![smallvec![Bytes::from_static(name.as_bytes())]],
    }
}

/// Argument vectors of one logical command.
///
/// Most commands carry a single chunk. Batched submissions (e.g. fanned-out
/// subscriptions) carry one chunk per wire command; synthetic replies for a
/// command that never reached a server are produced per chunk.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    chunks: SmallVec<[ArgChunk; 1]>,
}

impl CommandArgs {
    /// Appends an argument to the last chunk.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(arg.into());
        }
        self
    }

    /// Appends another command as a new chunk, turning `self` into a batch.
    #[must_use]
    pub fn batch(mut self, other: CommandArgs) -> Self {
        self.chunks.extend(other.chunks);
        self
    }

    /// Name of the first wire command, lossily decoded for logging.
    pub fn command_name(&self) -> String {
        self.chunks
            .first()
            .and_then(|chunk| chunk.first())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ArgChunk> {
        self.chunks.iter()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.is_empty())
    }
}

impl fmt::Display for CommandArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (chunk_idx, chunk) in self.chunks.iter().enumerate() {
            if chunk_idx > 0 {
                f.write_str("; ")?;
            }
            for (arg_idx, arg) in chunk.iter().enumerate() {
                if arg_idx > 0 {
                    f.write_str(" ")?;
                }
                f.write_str(&String::from_utf8_lossy(arg))?;
            }
        }
        Ok(())
    }
}
