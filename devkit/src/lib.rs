/*!
# NetWeb DevKit

Everything needed to exercise the controller without switches or a broker:
- `FakeFabric`: in-memory flow tables, packet tracing, fault injection
- `DiscoveryMessageBuilder`: discovery events and their wire form
- `TestHarness`: a started controller wired to a fabric
*/

pub mod builders;
pub mod fabric;
pub mod harness;

pub use builders::{host_ip, host_mac, DiscoveryMessageBuilder};
pub use fabric::{Delivery, FabricOp, FakeFabric, ProbeViolation};
pub use harness::TestHarness;
