pub mod utils;

mod headers_reactor;
