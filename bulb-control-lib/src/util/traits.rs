use crate::control_interface::Bulb;

/// The caller's device registry.
///
/// A bulb calls [`Registry::register`] once its first connection is up, and
/// [`Registry::unregister`] once it has no viable connection left. Going
/// through [`crate::util::registry::RegistryAdapter`] guarantees the two calls
/// are balanced per device.
pub trait Registry: Send + Sync {
    fn register(&self, bulb: &Bulb);

    fn unregister(&self, bulb: &Bulb);
}
