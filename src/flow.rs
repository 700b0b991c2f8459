pub mod address;
pub mod errors;
pub mod parser;
pub mod record;

pub use address::{int_to_ip, ip_to_int};
pub use errors::ParseError;
pub use parser::{parse, ParsedLine};
pub use record::{FlowAddr, FlowKey, FlowRecord};
