//! DistRHI 演示程序
//!
//! 无窗口运行：按配置选择后端，经由上传环形缓冲区把数据写入 GPU 缓冲区，
//! 再拷贝到回读缓冲区校验，循环若干帧后关闭设备。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件
//! cargo run
//!
//! # 命令行覆盖
//! cargo run -- --null --frames 2
//! cargo run -- --dx12 --debug-layer
//! ```

use anyhow::{ensure, Context};
use tracing::{debug, info};

use dist_rhi::core::{log, Config};
use dist_rhi::gfx::{self, DeviceVisitor};
use dist_rhi::renderer::{BufferDescriptor, Device, QueueType, RenderBackend};

/// 演示运行的帧数
const DEMO_FRAMES: u32 = 8;

/// 每帧上传的元素个数
const ELEMENT_COUNT: u64 = 1024;

/// 上传 -> 拷贝 -> 回读，逐帧校验结果
struct UploadRoundTrip {
    frames: u32,
}

impl DeviceVisitor for UploadRoundTrip {
    type Output = anyhow::Result<()>;

    fn visit<B: RenderBackend>(self, device: &mut Device<B>) -> Self::Output {
        let size = ELEMENT_COUNT * 4;
        let data = device.create_buffer(&BufferDescriptor::structured(ELEMENT_COUNT, 4).with_name("demo.data"))?;
        let readback = device.create_buffer(&BufferDescriptor::readback(size).with_name("demo.readback"))?;

        for frame in 0..self.frames {
            device.begin_frame()?;

            let values: Vec<u32> = (0..ELEMENT_COUNT as u32).map(|i| i.wrapping_mul(frame + 1)).collect();
            let mut ctx = device.context(QueueType::Copy)?;
            ctx.upload_buffer(device, data, 0, bytemuck::cast_slice(&values))?;
            ctx.copy_buffer(device, data, 0, readback, 0, size)?;
            let sync = device.execute(ctx)?;
            sync.wait(None)?;

            let bytes = device.read_buffer(readback, 0, size)?;
            let result: &[u32] = bytemuck::cast_slice(&bytes);
            ensure!(result == values.as_slice(), "readback mismatch in frame {frame}");
            debug!(frame, fence = %sync.value(), "Round trip verified");

            device.end_frame()?;
        }

        device.destroy_buffer(data);
        device.destroy_buffer(readback);

        let stats = device.stats();
        info!(
            frames = stats.frame_index,
            submissions = stats.submissions,
            pending_deletions = stats.pending_deletions,
            "Demo finished"
        );
        Ok(())
    }
}

/// 应用程序入口点
///
/// 1. 加载配置文件（config.toml）并应用命令行覆盖
/// 2. 初始化日志系统
/// 3. 创建设备并运行演示
/// 4. 关闭设备，报告泄漏
fn main() -> anyhow::Result<()> {
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args().skip(1));
    config.validate().context("invalid configuration")?;

    log::init_from_config(&config.logging).context("failed to initialize logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "DistRHI starting...");
    info!(
        backend = config.device.backend.name(),
        buffered_frames = config.device.buffered_frames,
        "Device configuration"
    );

    let mut device = gfx::create_device(&config).context("failed to create device")?;
    info!(api = %device.api(), adapter = device.adapter_name(), "Device initialized successfully");

    let run = device.visit(UploadRoundTrip { frames: DEMO_FRAMES });
    let shutdown = device.shutdown();
    run?;
    shutdown.context("device shutdown reported errors")?;

    info!("DistRHI exited cleanly");
    Ok(())
}
