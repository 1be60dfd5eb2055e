//! Production and in-memory implementations of the collaborator seams

mod etcd;
mod fake;

#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "docker")]
mod docker;

pub use etcd::EtcdStore;
pub use fake::FakeRuntime;
#[cfg(test)]
pub use fake::RuntimeCall;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
