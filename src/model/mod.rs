mod block;
mod conv;
mod extractor;
mod flow_net;
mod generator;
mod misc;
mod source;
mod target;

pub use block::*;
pub use conv::*;
pub use extractor::*;
pub use flow_net::*;
pub use generator::*;
pub use misc::*;
pub use source::*;
pub use target::*;
