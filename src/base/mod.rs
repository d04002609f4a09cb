pub mod utils;

pub use utils::{clock_time, formatted_size, prime_above, read_uint_from_env, FormattedSize};
