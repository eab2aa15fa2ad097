//! Consumer-facing helpers.
//!
//! UI code usually talks to holders through two seams only: change
//! subscriptions ([`Listenable`]) and handle attachment ([`HandleHost`]).
//! These free functions work against either seam, so a view can be written
//! once for plain notifiers, lifecycles and async lifecycles alike.

use crate::handle::{EnvHandle, HandleHost, HandleLease};
use crate::listener::{Listenable, Listener, Subscription};

/// Register `callback` for change rounds on `source`.
///
/// The callback stays registered until the returned [`Subscription`] is
/// dropped or passed to [`unsubscribe`].
pub fn subscribe<L>(source: &L, callback: impl Fn() + Send + Sync + 'static) -> Subscription
where
    L: Listenable + ?Sized,
{
    let registry = source.listeners();
    let id = registry.add(Listener::new(callback));
    registry.subscription(id)
}

/// Stop receiving notifications for `subscription`.
pub fn unsubscribe(subscription: Subscription) {
    subscription.unsubscribe();
}

/// Attach `handle` to `host`. The handle stays attached while the lease lives.
pub fn attach_handle<H>(host: &H, handle: EnvHandle) -> HandleLease
where
    H: HandleHost + ?Sized,
{
    host.broker().attach(handle)
}

/// Detach the most recent attachment of `handle` from `host`.
///
/// Returns `false` if `handle` was not attached.
pub fn detach_handle<H>(host: &H, handle: &EnvHandle) -> bool
where
    H: HandleHost + ?Sized,
{
    host.broker().detach(handle)
}
