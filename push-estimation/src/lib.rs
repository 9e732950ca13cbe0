//! Object state estimation for a simulated planar pushing task.
//!
//! A gripper pushes a disk around a tabletop. The filter tracks the
//! disk's pose `(x, y, cos theta, sin theta)` from a top-down camera,
//! the gripper position and the gripper's force/torque readings, with
//! dynamics and measurement models trained end-to-end through the
//! filter.

pub mod dataset;
pub mod train;

/// Timesteps per recorded trajectory.
pub const SEQ_LENGTH: usize = 32;
/// Object pose `(x, y, cos theta, sin theta)`.
pub const STATE_DIM: usize = 4;
/// Leading unconstrained entries of the state; the rest is the heading
/// pair.
pub const LINEAR_DIMS: usize = 2;
pub const CONTROL_DIM: usize = 7;
pub const IMAGE_SIZE: usize = 32;
pub const POS_DIM: usize = 3;
pub const SENSOR_DIM: usize = 7;
