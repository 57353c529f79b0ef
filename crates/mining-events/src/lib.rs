pub mod event;
pub mod hub;
pub mod ws;

pub use event::{ClientMessage, Event, EventType, MinerEventData, MinerStatsData};
pub use hub::{
    EventHub, EventHubConfig, EventReceiver, HubError, StateProvider, SubscriberHandle,
    Subscription, DEFAULT_MAX_CONNECTIONS,
};
