//! Frame timing and workload statistics.
//!
//! CPU and GPU frame times are smoothed with an exponential moving average so
//! the displayed numbers stay readable. GPU time comes from a two-entry
//! timestamp query pool written at the frame's start and end.

use std::time::Instant;

use ash::vk;

use crate::error::GraphicsError;

/// EMA fold used for both CPU and GPU milliseconds-per-frame.
fn smooth(current: f64, sample: f64) -> f64 {
    current * 0.95 + sample * 0.05
}

/// Per-frame statistics: smoothed frame times and workload counters.
pub struct RenderStats {
    device: ash::Device,
    query_pool: vk::QueryPool,
    timestamp_period: f64,
    mspf_cpu: f64,
    mspf_gpu: f64,
    draw_calls: u64,
    triangles: u64,
    cpu_frame_start: Instant,
}

impl RenderStats {
    /// Create the timestamp query pool.
    pub fn new(device: &ash::Device, timestamp_period: f32) -> Result<Self, GraphicsError> {
        let pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);

        let query_pool = unsafe { device.create_query_pool(&pool_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create timestamp query pool: {:?}",
                e
            ))
        })?;

        Ok(Self {
            device: device.clone(),
            query_pool,
            timestamp_period: timestamp_period as f64,
            mspf_cpu: 0.0,
            mspf_gpu: 0.0,
            draw_calls: 0,
            triangles: 0,
            cpu_frame_start: Instant::now(),
        })
    }

    /// Reset counters and write the frame-start timestamp.
    pub fn begin(&mut self, cmd: vk::CommandBuffer) {
        self.draw_calls = 0;
        self.triangles = 0;
        self.cpu_frame_start = Instant::now();

        unsafe {
            self.device.cmd_reset_query_pool(cmd, self.query_pool, 0, 2);
            self.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                0,
            );
        }
    }

    /// Write the frame-end timestamp.
    pub fn end_gpu(&mut self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                1,
            );
        }
    }

    /// Fold this frame's CPU time and the collected GPU timestamps into the
    /// moving averages. Blocks until both timestamps are available.
    pub fn end_cpu(&mut self) -> Result<(), GraphicsError> {
        let cpu_delta = self.cpu_frame_start.elapsed().as_secs_f64() * 1000.0;
        self.mspf_cpu = smooth(self.mspf_cpu, cpu_delta);

        let mut query_results = [0u64; 2];
        unsafe {
            self.device.get_query_pool_results(
                self.query_pool,
                0,
                &mut query_results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(|e| {
            GraphicsError::Internal(format!("Failed to read timestamp queries: {:?}", e))
        })?;

        let gpu_begin = query_results[0] as f64 * self.timestamp_period * 1e-6;
        let gpu_end = query_results[1] as f64 * self.timestamp_period * 1e-6;
        self.mspf_gpu = smooth(self.mspf_gpu, gpu_end - gpu_begin);

        Ok(())
    }

    /// Record one draw call.
    pub fn draw_call(&mut self) {
        self.draw_calls += 1;
    }

    /// Add triangles submitted by a draw call.
    pub fn count_triangles(&mut self, count: u64) {
        self.triangles += count;
    }

    pub fn mspf_cpu(&self) -> f64 {
        self.mspf_cpu
    }

    pub fn mspf_gpu(&self) -> f64 {
        self.mspf_gpu
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    pub fn triangles(&self) -> u64 {
        self.triangles
    }

    /// Title-bar string for the display layer.
    pub fn summary(&self) -> String {
        format_summary(self.mspf_cpu, self.mspf_gpu, self.draw_calls, self.triangles)
    }
}

fn format_summary(mspf_cpu: f64, mspf_gpu: f64, draw_calls: u64, triangles: u64) -> String {
    format!(
        "cpu: {mspf_cpu:.2}ms, gpu: {mspf_gpu:.2}ms, render calls: {draw_calls}, triangles: {triangles}"
    )
}

impl Drop for RenderStats {
    fn drop(&mut self) {
        unsafe { self.device.destroy_query_pool(self.query_pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smooth_converges_to_constant_sample() {
        let mut value = 0.0;
        for _ in 0..500 {
            value = smooth(value, 16.0);
        }
        assert!((value - 16.0).abs() < 0.01);
    }

    #[test]
    fn test_smooth_weights_history() {
        let value = smooth(10.0, 20.0);
        assert!((value - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_summary_format() {
        let text = format_summary(1.234, 0.567, 12, 34567);
        assert_eq!(
            text,
            "cpu: 1.23ms, gpu: 0.57ms, render calls: 12, triangles: 34567"
        );
    }
}
