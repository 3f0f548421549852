/*!
# NexusOps DevKit - Protocol stubs for tests

Lets either side of the session stream be tested without the other:
- `StubCoordinator`: scripted coordinator that records every heartbeat
- `StubEndpoint`: scripted endpoint that sends reports and reads directives
- `test_utils`: polling helpers and test logging
*/

pub mod stub_coordinator;
pub mod stub_endpoint;
pub mod test_utils;

pub use stub_coordinator::StubCoordinator;
pub use stub_endpoint::StubEndpoint;
pub use test_utils::{init_test_logging, wait_until};
