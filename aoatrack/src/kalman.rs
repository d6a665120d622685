//! Constant-velocity Kalman filter used for per-tag tracking

use anyhow::Result;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};

/// Measurement matrix: we observe position only
fn observation() -> Matrix2x4<f64> {
    Matrix2x4::new(
        1.0, 0.0, 0.0, 0.0, // x
        0.0, 1.0, 0.0, 0.0, // y
    )
}

#[derive(Debug, Clone)]
pub struct KalmanFilterParams {
    pub x: Vector4<f64>, // Initial state [x, y, vx, vy]
    pub p: Matrix4<f64>, // Initial state covariance
    pub r: Matrix2<f64>, // Observation noise covariance
    /// Acceleration variance of the white-noise-acceleration process model
    pub q_accel: f64,
}

/// Linear Kalman filter over state `[x, y, vx, vy]` with a variable time step.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    pub x: Vector4<f64>, // State vector
    pub p: Matrix4<f64>, // State covariance matrix
    pub r: Matrix2<f64>, // Observation noise covariance
    pub q_accel: f64,
    pub y: Vector2<f64>, // Last residual
    pub s: Matrix2<f64>, // Last innovation covariance
}

impl KalmanFilter {
    pub fn new(params: KalmanFilterParams) -> Self {
        Self {
            x: params.x,
            p: params.p,
            r: params.r,
            q_accel: params.q_accel,
            y: Vector2::zeros(),
            s: Matrix2::zeros(),
        }
    }

    /// State transition for elapsed time `dt`
    pub fn transition(dt: f64) -> Matrix4<f64> {
        let mut f = Matrix4::identity();
        f[(0, 2)] = dt; // x += vx * dt
        f[(1, 3)] = dt; // y += vy * dt
        f
    }

    /// Discrete white-noise-acceleration process covariance for `dt`
    pub fn process_noise(dt: f64, q_accel: f64) -> Matrix4<f64> {
        let half = 0.5 * dt * dt;
        // G maps an acceleration impulse onto [x, y, vx, vy]
        let g = Matrix4x2::new(
            half, 0.0, //
            0.0, half, //
            dt, 0.0, //
            0.0, dt,
        );
        g * g.transpose() * q_accel
    }

    /// Predict the state forward by `dt` seconds
    pub fn predict(&mut self, dt: f64) {
        let f = Self::transition(dt);

        // x = F * x
        self.x = f * self.x;

        // P = F * P * F^T + Q
        self.p = f * self.p * f.transpose() + Self::process_noise(dt, self.q_accel);
        self.symmetrize();
    }

    /// Update with a position observation `z = [x, y]`
    pub fn update(&mut self, z: Vector2<f64>) -> Result<()> {
        let h = observation();

        // Residual: y = z - H * x
        let y = z - h * self.x;

        // Innovation covariance: S = H * P * H^T + R
        let s = h * self.p * h.transpose() + self.r;

        // Kalman gain: K = P * H^T * S^-1
        let s_inv = s
            .try_inverse()
            .ok_or_else(|| anyhow::anyhow!("Failed to invert innovation covariance matrix"))?;
        let k = self.p * h.transpose() * s_inv;

        self.y = y;
        self.s = s;

        // Update state: x = x + K * y
        self.x += k * y;

        // Joseph form: P = (I - K H) P (I - K H)^T + K R K^T
        let i_kh = Matrix4::identity() - k * h;
        self.p = i_kh * self.p * i_kh.transpose() + k * self.r * k.transpose();
        self.symmetrize();

        Ok(())
    }

    /// Trace of the position block of the covariance
    pub fn position_trace(&self) -> f64 {
        self.p[(0, 0)] + self.p[(1, 1)]
    }

    pub fn get_state(&self) -> &Vector4<f64> {
        &self.x
    }

    pub fn get_covariance(&self) -> &Matrix4<f64> {
        &self.p
    }

    fn symmetrize(&mut self) {
        self.p = (self.p + self.p.transpose()) * 0.5;
    }
}
