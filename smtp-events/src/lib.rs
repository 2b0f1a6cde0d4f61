mod bus;
mod event;
mod statistics;

pub use bus::EventBus;
pub use event::Event;
pub use statistics::StatisticsCollector;
