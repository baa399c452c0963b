//! Client-side half of the canvas: optimistic paint reconciliation, viewport
//! debouncing and a reconnecting WebSocket session.

pub mod backoff;
pub mod camera;
pub mod connection;
pub mod debounce;
pub mod observer;
pub mod reconcile;

pub use camera::Camera;
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionStatus, Session};
pub use debounce::ViewportDebouncer;
pub use observer::{CanvasControls, Mode, Observable, Subscription};
pub use reconcile::{ReconciliationCache, Rollback};
