/// Built-in endpoints
///
/// These are the methods every daemon serves regardless of which domain
/// handlers get registered on top: session plumbing, version reporting,
/// cancellation and a couple of diagnostics used by client test suites.

pub mod meta;
pub mod utilities;

pub use meta::*;
pub use utilities::*;

use crate::router::Router;

/// Register every built-in method on `router`
///
/// `Meta.Authenticate` is not registered here: the authentication gate
/// answers it before the router ever sees it.
pub fn register_builtins(router: &mut Router) {
    router.register_typed("Meta.Flow", meta::flow);
    router.register_typed("Meta.Shutdown", meta::shutdown);
    router.register_typed("Version.Get", meta::version_get);

    router.register_typed("Ping", utilities::ping);
    router.register_typed("Cancel", utilities::cancel);
    router.register_typed("Network.SetSimulateOffline", utilities::set_simulate_offline);
    router.register_typed("Test.DoubleTwice", utilities::double_twice);
}
