// Metrics Pusher - scrapes host and container metrics and pushes them to a
// Prometheus-compatible gateway in the text exposition format.
//
// # Layout
// - `metrics` - collector contract, descriptors, registry, built-in collectors
// - `scrape` - concurrent, fault-isolated collector runs
// - `encoder` - text exposition encoding
// - `push` - gateway client
// - `scheduler` - periodic gather → encode → push loop
// - `module` - module lifecycle and manager
// - `config` - TOML settings

pub mod config;
pub mod encoder;
pub mod metrics;
pub mod module;
pub mod push;
pub mod scheduler;
pub mod scrape;
