/*!
# NetWeb Controller

Proactive SDN control plane: keeps a versioned view of switches, links and
hosts, computes a route for every host pair under the active policy
(hop count or bandwidth cost), programs the switches ahead of traffic, and
derives link throughput and loss from port counters.

The southbound side is the `SwitchTransport` trait; `switch_bridge` speaks
it over MQTT, the devkit fakes it in memory.
*/

pub mod config;
pub mod control;
pub mod convergence;
pub mod discovery;
pub mod error;
pub mod events;
pub mod flows;
pub mod health;
pub mod http;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod routing;
pub mod runtime;
pub mod state;
pub mod switch;
pub mod switch_bridge;
pub mod topology;
