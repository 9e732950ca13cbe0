//! Trajectory generation and batching for the pushing task.
//!
//! Trajectories come from a small planar simulation: a disk sits on a
//! tabletop and a gripper repeatedly approaches and pushes it. Each
//! recorded step holds the true object pose, the commanded gripper
//! motion, a rendered top-down camera frame and noisy force/torque
//! readings. Trajectories are stored as f32 blobs in `data.sqlite` and
//! read back through `SqliteDataset`.

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{backend::Backend, Data, Shape, Tensor};
use bytemuck::cast_slice;
use particle_filter::ObservationSeq;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{CONTROL_DIM, IMAGE_SIZE, POS_DIM, SENSOR_DIM, SEQ_LENGTH, STATE_DIM};

const OBJECT_RADIUS: f32 = 0.15;
const CONTACT_RADIUS: f32 = OBJECT_RADIUS + 0.04;
const GRIPPER_SPEED: f32 = 0.08;
const MAX_PUSH_SPEED: f32 = 0.06;
const RETARGET_PROB: f64 = 0.05;
const SENSOR_NOISE_STD: f32 = 0.02;
const PIXEL_NOISE_STD: f32 = 0.02;

/// One recorded trajectory, all fields `SEQ_LENGTH` timesteps of f32
/// values in native byte order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushItem {
    pub states: Vec<u8>,
    pub controls: Vec<u8>,
    pub images: Vec<u8>,
    pub gripper_pos: Vec<u8>,
    pub gripper_sensors: Vec<u8>,
}

fn push_f32s(blob: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        blob.extend_from_slice(&v.to_ne_bytes());
    }
}

fn render_image(
    object: [f32; 2],
    heading: [f32; 2],
    gripper: [f32; 2],
    rng: &mut SmallRng,
    pixel_noise: &Normal<f32>,
) -> Vec<f32> {
    let mut pixels = Vec::with_capacity(IMAGE_SIZE * IMAGE_SIZE);
    for py in 0..IMAGE_SIZE {
        for px in 0..IMAGE_SIZE {
            let wx = (px as f32 + 0.5) / IMAGE_SIZE as f32 * 2.0 - 1.0;
            let wy = (py as f32 + 0.5) / IMAGE_SIZE as f32 * 2.0 - 1.0;
            let mut value = 0.0f32;

            let dx = wx - object[0];
            let dy = wy - object[1];
            let dist = (dx * dx + dy * dy).sqrt();
            if dist < OBJECT_RADIUS {
                // Shade along the heading so the orientation is visible.
                let along = if dist > 1e-4 {
                    (dx * heading[0] + dy * heading[1]) / dist
                } else {
                    0.0
                };
                value = 0.6 + 0.3 * along.max(0.0);
            }

            let gx = wx - gripper[0];
            let gy = wy - gripper[1];
            if (gx * gx + gy * gy).sqrt() < 0.06 {
                value = 1.0;
            }

            pixels.push((value + pixel_noise.sample(rng)).clamp(0.0, 1.0));
        }
    }
    pixels
}

fn simulate_trajectory(rng: &mut SmallRng) -> PushItem {
    let sensor_noise = Normal::new(0.0, SENSOR_NOISE_STD).unwrap();
    let pixel_noise = Normal::new(0.0, PIXEL_NOISE_STD).unwrap();

    let mut object = [rng.gen_range(-0.5..0.5f32), rng.gen_range(-0.5..0.5f32)];
    let mut theta = rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
    let mut push_angle = rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
    let mut push_speed = rng.gen_range(0.5 * MAX_PUSH_SPEED..MAX_PUSH_SPEED);
    // Start the gripper on the rim opposite the push direction.
    let mut gripper = [
        object[0] - push_angle.cos() * (CONTACT_RADIUS + 0.2),
        object[1] - push_angle.sin() * (CONTACT_RADIUS + 0.2),
    ];

    let mut item = PushItem {
        states: Vec::with_capacity(SEQ_LENGTH * STATE_DIM * 4),
        controls: Vec::with_capacity(SEQ_LENGTH * CONTROL_DIM * 4),
        images: Vec::with_capacity(SEQ_LENGTH * IMAGE_SIZE * IMAGE_SIZE * 4),
        gripper_pos: Vec::with_capacity(SEQ_LENGTH * POS_DIM * 4),
        gripper_sensors: Vec::with_capacity(SEQ_LENGTH * SENSOR_DIM * 4),
    };

    for _ in 0..SEQ_LENGTH {
        if rng.gen_bool(RETARGET_PROB) {
            push_angle = rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
            push_speed = rng.gen_range(0.5 * MAX_PUSH_SPEED..MAX_PUSH_SPEED);
            gripper = [
                object[0] - push_angle.cos() * (CONTACT_RADIUS + 0.2),
                object[1] - push_angle.sin() * (CONTACT_RADIUS + 0.2),
            ];
        }

        // The gripper closes on the contact point behind the object.
        let target = [
            object[0] - push_angle.cos() * OBJECT_RADIUS,
            object[1] - push_angle.sin() * OBJECT_RADIUS,
        ];
        let to_target = [target[0] - gripper[0], target[1] - gripper[1]];
        let gap = (to_target[0] * to_target[0] + to_target[1] * to_target[1]).sqrt();
        let step = GRIPPER_SPEED.min(gap);
        let velocity = if gap > 1e-5 {
            [to_target[0] / gap * step, to_target[1] / gap * step]
        } else {
            [0.0, 0.0]
        };
        gripper[0] += velocity[0];
        gripper[1] += velocity[1];

        let offset = [object[0] - gripper[0], object[1] - gripper[1]];
        let reach = (offset[0] * offset[0] + offset[1] * offset[1]).sqrt();
        let contact = reach < CONTACT_RADIUS;

        let mut force = [0.0f32, 0.0];
        if contact {
            force = [push_angle.cos() * push_speed, push_angle.sin() * push_speed];
            object[0] = (object[0] + force[0]).clamp(-0.9, 0.9);
            object[1] = (object[1] + force[1]).clamp(-0.9, 0.9);
            // Off-center contact twists the object toward the push line.
            let lateral = offset[0] * push_angle.sin() - offset[1] * push_angle.cos();
            theta += 0.5 * lateral;
        }

        let state = [object[0], object[1], theta.cos(), theta.sin()];
        let controls = [
            velocity[0],
            velocity[1],
            0.0,
            push_angle.cos(),
            push_angle.sin(),
            push_speed,
            contact as u8 as f32,
        ];
        let gripper_pos = [
            gripper[0] + sensor_noise.sample(rng),
            gripper[1] + sensor_noise.sample(rng),
            0.05 + sensor_noise.sample(rng),
        ];
        let torque = offset[0] * force[1] - offset[1] * force[0];
        let gripper_sensors = [
            force[0] + sensor_noise.sample(rng),
            force[1] + sensor_noise.sample(rng),
            sensor_noise.sample(rng),
            sensor_noise.sample(rng),
            sensor_noise.sample(rng),
            torque + sensor_noise.sample(rng),
            contact as u8 as f32,
        ];

        push_f32s(&mut item.states, &state);
        push_f32s(&mut item.controls, &controls);
        push_f32s(
            &mut item.images,
            &render_image(object, [theta.cos(), theta.sin()], gripper, rng, &pixel_noise),
        );
        push_f32s(&mut item.gripper_pos, &gripper_pos);
        push_f32s(&mut item.gripper_sensors, &gripper_sensors);
    }

    item
}

/// Simulates `len` trajectories into the `table` table of `data.sqlite`,
/// replacing whatever was there.
pub fn create_dataset(len: usize, table: &str) -> anyhow::Result<()> {
    let mut db = Connection::open("data.sqlite")?;
    if let Err(e) = db.execute(&format!("DROP TABLE {table};"), params![]) {
        log::debug!("no previous {table} table to drop: {e}");
    }
    db.execute(
        &format!(
            "CREATE TABLE {table} (row_id INTEGER, states BLOB, controls BLOB, \
             images BLOB, gripper_pos BLOB, gripper_sensors BLOB);"
        ),
        params![],
    )?;

    let mut rng = SmallRng::from_entropy();
    let mut written = 0usize;
    while written < len {
        let tx = db.transaction()?;
        for _ in 0..1000.min(len - written) {
            written += 1;
            let item = simulate_trajectory(&mut rng);
            tx.execute(
                &format!(
                    "INSERT INTO {table} (row_id, states, controls, images, \
                     gripper_pos, gripper_sensors) VALUES (?1, ?2, ?3, ?4, ?5, ?6);"
                ),
                params![
                    written,
                    item.states,
                    item.controls,
                    item.images,
                    item.gripper_pos,
                    item.gripper_sensors
                ],
            )?;
        }
        tx.commit()?;
        log::info!("generated {written}/{len} {table} trajectories");
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct PushBatch<B: Backend> {
    /// True object poses, `[n, t, 4]`.
    pub states: Tensor<B, 3>,
    /// Commanded gripper motion, `[n, t, 7]`.
    pub controls: Tensor<B, 3>,
    pub observations: ObservationSeq<B>,
}

#[derive(Clone)]
pub struct PushBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> PushBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn stack(&self, blobs: Vec<&[u8]>, per_item: usize) -> Vec<f32> {
        let mut values = Vec::with_capacity(blobs.len() * per_item);
        for blob in blobs {
            values.extend_from_slice(cast_slice::<u8, f32>(blob));
        }
        values
    }
}

impl<B: Backend> Batcher<PushItem, PushBatch<B>> for PushBatcher<B> {
    fn batch(&self, items: Vec<PushItem>) -> PushBatch<B> {
        let n = items.len();
        let t = SEQ_LENGTH;

        let states = self.stack(items.iter().map(|i| i.states.as_slice()).collect(), t * STATE_DIM);
        let controls = self.stack(
            items.iter().map(|i| i.controls.as_slice()).collect(),
            t * CONTROL_DIM,
        );
        let images = self.stack(
            items.iter().map(|i| i.images.as_slice()).collect(),
            t * IMAGE_SIZE * IMAGE_SIZE,
        );
        let gripper_pos = self.stack(
            items.iter().map(|i| i.gripper_pos.as_slice()).collect(),
            t * POS_DIM,
        );
        let gripper_sensors = self.stack(
            items.iter().map(|i| i.gripper_sensors.as_slice()).collect(),
            t * SENSOR_DIM,
        );

        PushBatch {
            states: Tensor::from_data(
                Data::new(states, Shape::new([n, t, STATE_DIM])).convert(),
                &self.device,
            ),
            controls: Tensor::from_data(
                Data::new(controls, Shape::new([n, t, CONTROL_DIM])).convert(),
                &self.device,
            ),
            observations: ObservationSeq {
                images: Tensor::from_data(
                    Data::new(images, Shape::new([n, t, IMAGE_SIZE, IMAGE_SIZE])).convert(),
                    &self.device,
                ),
                gripper_pos: Tensor::from_data(
                    Data::new(gripper_pos, Shape::new([n, t, POS_DIM])).convert(),
                    &self.device,
                ),
                gripper_sensors: Tensor::from_data(
                    Data::new(gripper_sensors, Shape::new([n, t, SENSOR_DIM])).convert(),
                    &self.device,
                ),
            },
        }
    }
}
