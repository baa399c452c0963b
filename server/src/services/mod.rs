pub mod pixel_persister;
pub mod progression_worker;
pub mod rate_status_broadcaster;
