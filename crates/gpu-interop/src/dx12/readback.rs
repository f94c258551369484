//! D3D12 readback through readback-heap buffers.
//!
//! Each staging entry owns a buffer on `D3D12_HEAP_TYPE_READBACK` laid out
//! by `GetCopyableFootprints` (rows aligned to 256 bytes) and its own command
//! allocator and list, so an entry whose copy timed out never blocks the
//! others from recording. Completion is tracked with one fence on the host's
//! queue; every copy signals a new fence value.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use windows::core::{IUnknown, Interface, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::System::Threading::{CreateEventW, ResetEvent, WaitForSingleObject};

use readback_core::{
    copy_rows, required_source_len, NativeTexture, PixelFormat, ReadLayout, ReadbackError,
    StagingKey, TargetDesc,
};
use tracing::{debug, error, trace};

use crate::backend::{CopyStatus, GraphicsApi, ReadbackBackend, StagingId};
use crate::dxgi;

struct ReadbackBuffer {
    key: StagingKey,
    buffer: ID3D12Resource,
    footprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT,
    total_bytes: u64,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    /// Fence value signalled after the last copy, until it is observed.
    pending: Option<u64>,
}

/// Readback backend for a host-owned D3D12 device and command queue.
pub struct Dx12Backend {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    list_type: D3D12_COMMAND_LIST_TYPE,
    fence: ID3D12Fence,
    fence_event: HANDLE,
    last_fence_value: u64,
    /// State the host keeps its render targets in between frames.
    source_state: D3D12_RESOURCE_STATES,
    staging: HashMap<u64, ReadbackBuffer>,
    next_id: u64,
    lost: bool,
}

/// Borrow `resource` into a descriptor field without touching its refcount.
fn borrowed(resource: &ID3D12Resource) -> ManuallyDrop<Option<ID3D12Resource>> {
    unsafe { std::mem::transmute_copy(resource) }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: borrowed(resource),
                StateBefore: before,
                StateAfter: after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}

/// Block until `fence` reaches `value` or `timeout` passes; returns whether it
/// was reached.
///
/// `event` is shared across waits, and a registration left by an earlier
/// timed-out wait can still set it, so a wakeup only counts once the fence
/// value has been rechecked.
fn wait_for_fence(
    fence: &ID3D12Fence,
    event: HANDLE,
    value: u64,
    timeout: Duration,
) -> windows::core::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if unsafe { fence.GetCompletedValue() } >= value {
            return Ok(true);
        }
        unsafe {
            ResetEvent(event)?;
            fence.SetEventOnCompletion(value, event)?;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = u32::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(u32::MAX - 1);
        if unsafe { WaitForSingleObject(event, millis) } != WAIT_OBJECT_0 {
            return Ok(unsafe { fence.GetCompletedValue() } >= value);
        }
    }
}

fn source_resource(target: NativeTexture) -> Result<ID3D12Resource, ReadbackError> {
    if target.is_null() {
        return Err(ReadbackError::InvalidTarget);
    }
    let raw: *mut c_void = target.as_ptr();
    let unknown =
        unsafe { IUnknown::from_raw_borrowed(&raw) }.ok_or(ReadbackError::InvalidTarget)?;
    unknown
        .cast::<ID3D12Resource>()
        .map_err(|_| ReadbackError::InvalidTarget)
}

impl Dx12Backend {
    /// Build a backend on the host's device and the queue it renders on.
    ///
    /// Copies are submitted to `queue`, after whatever the host already
    /// queued, so they observe the finished frame.
    pub fn new(device: &ID3D12Device, queue: &ID3D12CommandQueue) -> Result<Self> {
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .map_err(|e| anyhow!("CreateFence failed: {e}"))?;
        let fence_event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map_err(|e| anyhow!("CreateEventW failed: {e}"))?;
        let list_type = unsafe { queue.GetDesc() }.Type;

        debug!(?list_type, "D3D12 readback backend initialised");
        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            list_type,
            fence,
            fence_event,
            last_fence_value: 0,
            source_state: D3D12_RESOURCE_STATE_COMMON,
            staging: HashMap::new(),
            next_id: 0,
            lost: false,
        })
    }

    /// Declare the state render targets are in when a read is issued. The
    /// copy transitions them to `COPY_SOURCE` and back. With the default,
    /// `COMMON`, no barriers are recorded and the implicit promotion to
    /// `COPY_SOURCE` is relied on.
    pub fn with_source_state(mut self, state: D3D12_RESOURCE_STATES) -> Self {
        self.source_state = state;
        self
    }

    fn needs_barriers(&self) -> bool {
        self.source_state != D3D12_RESOURCE_STATE_COMMON
            && self.source_state != D3D12_RESOURCE_STATE_COPY_SOURCE
    }

    fn device_removed(&self) -> bool {
        unsafe { self.device.GetDeviceRemovedReason() }.is_err()
    }

    fn fail(&mut self, what: &str, e: &windows::core::Error) -> ReadbackError {
        let err = dxgi::copy_error(what, e, self.device_removed());
        if err.is_device_lost() {
            error!("D3D12 device lost during {what}: {e}");
            self.lost = true;
        } else {
            error!("D3D12 {what} failed: {e}");
        }
        err
    }

    fn check_device(&mut self) -> Result<(), ReadbackError> {
        if self.lost {
            return Err(ReadbackError::device_lost("D3D12 device removed"));
        }
        if let Err(e) = unsafe { self.device.GetDeviceRemovedReason() } {
            error!("D3D12 device removed: {e}");
            self.lost = true;
            return Err(ReadbackError::device_lost(format!("D3D12 device removed: {e}")));
        }
        Ok(())
    }

    fn completed_value(&mut self) -> Result<u64, ReadbackError> {
        let value = unsafe { self.fence.GetCompletedValue() };
        // A removed device reports UINT64_MAX for every fence.
        if value == u64::MAX {
            self.check_device()?;
        }
        Ok(value)
    }

    fn create_buffer(&mut self, key: StagingKey) -> Result<ReadbackBuffer, ReadbackError> {
        let tex_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: key.width as u64,
            Height: key.height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: dxgi::dxgi_format(key.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let mut footprint = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut total_bytes: u64 = 0;
        unsafe {
            self.device.GetCopyableFootprints(
                &tex_desc,
                0,
                1,
                0,
                Some(&mut footprint as *mut _),
                None,
                None,
                Some(&mut total_bytes as *mut _),
            )
        };

        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_READBACK,
            ..Default::default()
        };
        let buffer_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: total_bytes,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let mut buffer: Option<ID3D12Resource> = None;
        if let Err(e) = unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &buffer_desc,
                D3D12_RESOURCE_STATE_COPY_DEST,
                None,
                &mut buffer,
            )
        } {
            return Err(self.fail("CreateCommittedResource (readback)", &e));
        }
        let buffer = buffer
            .ok_or_else(|| ReadbackError::copy_failed("CreateCommittedResource returned nothing"))?;

        let allocator: ID3D12CommandAllocator =
            match unsafe { self.device.CreateCommandAllocator(self.list_type) } {
                Ok(a) => a,
                Err(e) => return Err(self.fail("CreateCommandAllocator", &e)),
            };
        let list: ID3D12GraphicsCommandList = match unsafe {
            self.device.CreateCommandList(
                0,
                self.list_type,
                &allocator,
                None::<&ID3D12PipelineState>,
            )
        } {
            Ok(l) => l,
            Err(e) => return Err(self.fail("CreateCommandList", &e)),
        };
        // Lists are created recording; keep them closed between copies.
        if let Err(e) = unsafe { list.Close() } {
            return Err(self.fail("Close", &e));
        }

        Ok(ReadbackBuffer {
            key,
            buffer,
            footprint,
            total_bytes,
            allocator,
            list,
            pending: None,
        })
    }
}

impl Drop for Dx12Backend {
    fn drop(&mut self) {
        self.staging.clear();
        unsafe {
            let _ = CloseHandle(self.fence_event);
        }
    }
}

impl ReadbackBackend for Dx12Backend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn kind(&self) -> GraphicsApi {
        GraphicsApi::Direct3D12
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn describe(&self, target: NativeTexture) -> Result<TargetDesc, ReadbackError> {
        let resource = source_resource(target)?;
        let desc = unsafe { resource.GetDesc() };
        if desc.Dimension != D3D12_RESOURCE_DIMENSION_TEXTURE2D {
            return Err(ReadbackError::InvalidTarget);
        }
        if desc.SampleDesc.Count > 1 {
            return Err(ReadbackError::unsupported_native(format!(
                "multisampled ({}x) texture",
                desc.SampleDesc.Count
            )));
        }
        let format = dxgi::pixel_format(desc.Format).ok_or_else(|| dxgi::unsupported(desc.Format))?;
        let width = u32::try_from(desc.Width).map_err(|_| ReadbackError::InvalidTarget)?;
        Ok(TargetDesc::new(width, desc.Height, format))
    }

    fn create_staging(&mut self, key: StagingKey) -> Result<StagingId, ReadbackError> {
        self.check_device()?;
        let buffer = self.create_buffer(key)?;
        self.next_id += 1;
        let id = self.next_id;
        debug!(
            id,
            ?key,
            row_pitch = buffer.footprint.Footprint.RowPitch,
            total = buffer.total_bytes,
            "D3D12 readback buffer created"
        );
        self.staging.insert(id, buffer);
        Ok(StagingId(id))
    }

    fn release_staging(&mut self, id: StagingId) {
        if self.staging.remove(&id.0).is_some() {
            debug!(%id, "D3D12 readback buffer released");
        }
    }

    fn copy_to_staging(
        &mut self,
        target: NativeTexture,
        id: StagingId,
    ) -> Result<(), ReadbackError> {
        self.check_device()?;
        let desc = self.describe(target)?;
        let source = source_resource(target)?;
        let source_format = unsafe { source.GetDesc() }.Format;
        let completed = self.completed_value()?;
        let barriers = self.needs_barriers();
        let source_state = self.source_state;
        let fence_value = self.last_fence_value + 1;

        let staging = self
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        if staging.key != desc.staging_key() {
            return Err(ReadbackError::copy_failed(format!(
                "{id} is {:?}, source is {desc:?}",
                staging.key
            )));
        }
        if matches!(staging.pending, Some(v) if v > completed) {
            return Err(ReadbackError::copy_failed(format!(
                "{id} is still the target of an unfinished copy"
            )));
        }

        // The copy location must name the source's exact format; the
        // footprint layout is identical across a typeless group.
        let mut footprint = staging.footprint;
        footprint.Footprint.Format = source_format;

        let recorded: windows::core::Result<()> = unsafe {
            (|| {
                staging.allocator.Reset()?;
                staging
                    .list
                    .Reset(&staging.allocator, None::<&ID3D12PipelineState>)?;
                if barriers {
                    staging.list.ResourceBarrier(&[transition_barrier(
                        &source,
                        source_state,
                        D3D12_RESOURCE_STATE_COPY_SOURCE,
                    )]);
                }
                let dst = D3D12_TEXTURE_COPY_LOCATION {
                    pResource: borrowed(&staging.buffer),
                    Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        PlacedFootprint: footprint,
                    },
                };
                let src = D3D12_TEXTURE_COPY_LOCATION {
                    pResource: borrowed(&source),
                    Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        SubresourceIndex: 0,
                    },
                };
                staging.list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
                if barriers {
                    staging.list.ResourceBarrier(&[transition_barrier(
                        &source,
                        D3D12_RESOURCE_STATE_COPY_SOURCE,
                        source_state,
                    )]);
                }
                staging.list.Close()?;
                let list: ID3D12CommandList = staging.list.cast()?;
                self.queue.ExecuteCommandLists(&[Some(list)]);
                self.queue.Signal(&self.fence, fence_value)
            })()
        };
        if let Err(e) = recorded {
            return Err(self.fail("copy submission", &e));
        }

        staging.pending = Some(fence_value);
        trace!(%id, key = ?staging.key, fence_value, "D3D12 copy submitted");
        self.last_fence_value = fence_value;
        Ok(())
    }

    fn poll_copy(&mut self, id: StagingId) -> Result<CopyStatus, ReadbackError> {
        self.check_device()?;
        let completed = self.completed_value()?;
        let staging = self
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        match staging.pending {
            Some(value) if value > completed => Ok(CopyStatus::Pending),
            _ => {
                staging.pending = None;
                Ok(CopyStatus::Complete)
            }
        }
    }

    fn wait_copy(&mut self, id: StagingId, timeout: Duration) -> Result<CopyStatus, ReadbackError> {
        if self.poll_copy(id)? == CopyStatus::Complete {
            return Ok(CopyStatus::Complete);
        }
        let value = self
            .staging
            .get(&id.0)
            .and_then(|s| s.pending)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;

        match wait_for_fence(&self.fence, self.fence_event, value, timeout) {
            Ok(true) => {}
            Ok(false) => trace!(%id, value, ?timeout, "D3D12 fence wait timed out"),
            Err(e) => return Err(self.fail("fence wait", &e)),
        }
        self.poll_copy(id)
    }

    fn read_staging(
        &mut self,
        id: StagingId,
        layout: &ReadLayout,
        out: &mut [u8],
    ) -> Result<(), ReadbackError> {
        self.check_device()?;
        let (buffer, offset, pitch, total) = match self.staging.get(&id.0) {
            Some(s) if s.pending.is_some() => {
                return Err(ReadbackError::copy_failed(format!(
                    "{id} mapped before its copy completed"
                )))
            }
            Some(s) => (
                s.buffer.clone(),
                s.footprint.Offset as usize,
                s.footprint.Footprint.RowPitch as usize,
                s.total_bytes as usize,
            ),
            None => return Err(ReadbackError::copy_failed(format!("unknown {id}"))),
        };

        let read_range = D3D12_RANGE {
            Begin: 0,
            End: total,
        };
        let mut data: *mut c_void = std::ptr::null_mut();
        let mapped =
            unsafe { buffer.Map(0, Some(&read_range as *const _), Some(&mut data as *mut _)) };
        if let Err(e) = mapped {
            return Err(self.fail("Map", &e));
        }

        let result = if data.is_null() {
            Err(ReadbackError::copy_failed("Map returned a null pointer"))
        } else {
            let len = required_source_len(
                pitch,
                layout.desc.row_bytes(),
                layout.desc.height as usize,
            )
            .min(total.saturating_sub(offset));
            // SAFETY: the buffer is `total` bytes and stays mapped until Unmap.
            let src = unsafe { std::slice::from_raw_parts((data as *const u8).add(offset), len) };
            copy_rows(src, pitch, out, layout)
        };

        // Nothing was written by the CPU.
        let written = D3D12_RANGE { Begin: 0, End: 0 };
        unsafe { buffer.Unmap(0, Some(&written as *const _)) };
        result
    }

    fn device_lost(&self) -> bool {
        self.lost || self.device_removed()
    }
}
