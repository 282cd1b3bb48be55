pub mod classifier;
pub mod cluster_scene;
pub mod demo_source;
pub mod frame_buffer;
pub mod frame_buffer_pool;
pub mod motion;
pub mod palette;
pub mod rate_counter;
pub mod surface;
