pub mod gateway;
pub mod transport;

pub use gateway::BrokerGateway;
pub use transport::{BrokerTransport, HttpBrokerTransport, MockBrokerTransport};
