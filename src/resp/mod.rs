/*!
Object model for the data exchanged with the connection layer.

The connection layer owns the [RESP](https://redis.io/docs/reference/protocol-spec/)
wire format; the core emits [`CommandArgs`] argument vectors and consumes
replies already parsed into [`Value`] trees.
*/
mod command_args;
mod value;

pub use command_args::*;
pub use value::*;
