//! DirectX 12 上下文
//!
//! 负责调试层、DXGI 工厂、适配器选择和 D3D12 设备创建，
//! 以及基于 `ID3D12Fence` 的栅栏。

use std::time::Duration;

use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};

use crate::core::error::{BackendApi, Result, RhiError};
use crate::renderer::sync::{device_lost, GpuFence};

pub(crate) fn dx_error(call: &'static str, err: windows::core::Error) -> RhiError {
    RhiError::backend(BackendApi::Dx12, call, err)
}

/// D3D12 设备及其适配器
pub struct Dx12Context {
    pub factory: IDXGIFactory4,
    pub device: ID3D12Device,
    pub adapter_name: String,
}

// D3D12 设备是自由线程对象
unsafe impl Send for Dx12Context {}
unsafe impl Sync for Dx12Context {}

impl Dx12Context {
    pub fn new(debug_layer: bool) -> Result<Self> {
        // SAFETY: 以下都是 D3D12 / DXGI 初始化调用，参数在调用期间有效
        unsafe {
            if debug_layer {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to enable DX12 Debug Layer"),
                }
            }

            let flags = if debug_layer {
                DXGI_CREATE_FACTORY_DEBUG
            } else {
                DXGI_CREATE_FACTORY_FLAGS(0)
            };
            let factory: IDXGIFactory4 = CreateDXGIFactory2(flags).map_err(|e| dx_error("CreateDXGIFactory2", e))?;

            let (device, adapter_name) = pick_adapter(&factory)?;
            info!(adapter = %adapter_name, "D3D12 Device created successfully");

            Ok(Self {
                factory,
                device,
                adapter_name,
            })
        }
    }
}

/// 选择第一个能创建 D3D12 设备的硬件适配器
unsafe fn pick_adapter(factory: &IDXGIFactory4) -> Result<(ID3D12Device, String)> {
    let mut index = 0;
    while let Ok(adapter) = factory.EnumAdapters1(index) {
        index += 1;
        let Ok(desc) = adapter.GetDesc1() else {
            continue;
        };
        let name_len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
        let name = String::from_utf16_lossy(&desc.Description[..name_len]);

        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            debug!(adapter = %name, "Skipping software adapter");
            continue;
        }

        let mut device: Option<ID3D12Device> = None;
        if D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device).is_ok() {
            if let Some(device) = device {
                return Ok((device, name));
            }
        }
        debug!(adapter = %name, "Adapter does not support D3D12");
    }

    // 没有硬件适配器时退回 WARP
    let warp: IDXGIAdapter = factory.EnumWarpAdapter().map_err(|e| dx_error("EnumWarpAdapter", e))?;
    let mut device: Option<ID3D12Device> = None;
    D3D12CreateDevice(&warp, D3D_FEATURE_LEVEL_11_0, &mut device).map_err(|e| dx_error("D3D12CreateDevice", e))?;
    let device = device.ok_or_else(|| RhiError::backend(BackendApi::Dx12, "D3D12CreateDevice", "no device returned"))?;
    warn!("No hardware adapter found, using WARP");
    Ok((device, "Microsoft Basic Render Driver (WARP)".to_string()))
}

/// `ID3D12Fence` 栅栏
pub struct Dx12Fence {
    pub fence: ID3D12Fence,
}

unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}

impl Dx12Fence {
    pub fn new(device: &ID3D12Device, initial_value: u64) -> Result<Self> {
        // SAFETY: 设备有效
        let fence: ID3D12Fence =
            unsafe { device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }.map_err(|e| dx_error("CreateFence", e))?;
        Ok(Self { fence })
    }

    pub fn raw(&self) -> &ID3D12Fence {
        &self.fence
    }
}

impl GpuFence for Dx12Fence {
    fn completed_value(&self) -> u64 {
        // SAFETY: 栅栏有效
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        if self.completed_value() >= value {
            return Ok(());
        }

        // SAFETY: 事件只在本次等待中使用，返回前关闭
        unsafe {
            let event = CreateEventA(None, false, false, None).map_err(|e| dx_error("CreateEventA", e))?;
            let result = self
                .fence
                .SetEventOnCompletion(value, event)
                .map_err(|e| dx_error("SetEventOnCompletion", e))
                .and_then(|()| {
                    let millis = timeout.map_or(INFINITE, |t| t.as_millis().min(u128::from(INFINITE - 1)) as u32);
                    match WaitForSingleObject(event, millis) {
                        WAIT_OBJECT_0 => Ok(()),
                        WAIT_TIMEOUT => Err(device_lost(value, timeout.unwrap_or_default())),
                        other => Err(RhiError::backend(
                            BackendApi::Dx12,
                            "WaitForSingleObject",
                            format!("unexpected wait result {:#x}", other.0),
                        )),
                    }
                });
            let _ = CloseHandle(event);
            result
        }
    }
}

impl std::fmt::Debug for Dx12Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dx12Fence")
            .field("fence", &self.fence.as_raw())
            .finish()
    }
}
