mod fetcher;
mod traits;

pub use fetcher::{parse_line, HttpBlocklistSource, LineEntry};
pub use traits::BlocklistSource;
