//! Memory patch driver
//!
//! On explicit flush, queue submit or set-event, every currently mapped,
//! host-visible memory object that was touched since the last scan gets
//! diffed against its shadow copy and the sparse delta is emitted as update
//! packets, one per bound object overlapping the touched region.
//!
//! The application may instead hand in pre-computed marked ranges together
//! with a trusted-flush hint, in which case the listed bytes are recorded
//! verbatim and no scan happens.

use {
    crate::{
        capture::{ThreadWriter, TraceRecords},
        stream::{PacketTag, WireHandle},
        track::{AliasRef, MemoryRecord},
    },
    ash::vk,
    log::{debug, trace},
    std::sync::atomic::Ordering,
};

/// Why a flush pass is running; only the statistics care.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushReason {
    QueueSubmit,
    SetEvent,
    Explicit,
}

/// One application-supplied range carrying device addresses (or other bytes
/// the application promises it has written).
#[derive(Clone, Copy, Debug)]
pub struct MarkedRange {
    pub offset: u64,
    pub size: u64,
}

const STRIDE: u64 = 8;

fn align_down(value: u64, alignment: u64) -> u64 {
    value - value % alignment
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value + (alignment - value % alignment) % alignment
}

fn update_tag(object_type: vk::ObjectType) -> PacketTag {
    match object_type {
        vk::ObjectType::IMAGE => PacketTag::ImageUpdate,
        vk::ObjectType::BUFFER => PacketTag::BufferUpdate,
        _ => PacketTag::TensorUpdate,
    }
}

/// Look the wire handle and extent of a bound object up.
fn bound_extent(records: &TraceRecords, alias: AliasRef) -> Option<(WireHandle, u64, u64, bool)> {
    match alias.object_type {
        vk::ObjectType::BUFFER => {
            let record = records.buffers.at_index(alias.index).read();
            Some((
                record.base.wire_handle(),
                record.binding.offset,
                record.binding.size,
                record.binding.accessible,
            ))
        }
        vk::ObjectType::IMAGE => {
            let record = records.images.at_index(alias.index).read();
            Some((
                record.base.wire_handle(),
                record.binding.offset,
                record.binding.size,
                record.binding.accessible,
            ))
        }
        _ => {
            let record = records.tensors.at_index(alias.index).read();
            Some((
                record.base.wire_handle(),
                record.binding.offset,
                record.binding.size,
                record.binding.accessible,
            ))
        }
    }
}

fn note_written(records: &TraceRecords, alias: AliasRef, bytes: u64) {
    match alias.object_type {
        vk::ObjectType::BUFFER => {
            let mut record = records.buffers.at_index(alias.index).write();
            record.binding.written += bytes;
            record.binding.updates += 1;
        }
        vk::ObjectType::IMAGE => {
            let mut record = records.images.at_index(alias.index).write();
            record.binding.written += bytes;
            record.binding.updates += 1;
        }
        _ => {
            let mut record = records.tensors.at_index(alias.index).write();
            record.binding.written += bytes;
            record.binding.updates += 1;
        }
    }
}

/// Scan one memory object and emit update packets for every touched bound
/// object. The record lock is held for the whole scan so the application
/// cannot remap the memory under us. Returns the number of payload bytes
/// written out.
#[profiling::function]
pub fn flush_mapped_memory(
    records: &TraceRecords,
    writer: &ThreadWriter,
    device: WireHandle,
    memory_handle: u64,
    reason: FlushReason,
    trusted: Option<&[MarkedRange]>,
) -> u64 {
    let Some(memory) = records.memories.at(memory_handle) else {
        return 0;
    };

    match reason {
        FlushReason::QueueSubmit => &writer.stats.flushes_queue,
        FlushReason::SetEvent => &writer.stats.flushes_event,
        FlushReason::Explicit => &writer.stats.flushes_queue,
    }
    .fetch_add(1, Ordering::Relaxed);

    let mut memory = memory.write();
    if !memory.is_host_visible() || !memory.is_mapped() || memory.shadow.is_none() {
        return 0;
    }
    writer.stats.memory_devices.fetch_add(1, Ordering::Relaxed);

    if let Some(ranges) = trusted {
        return trusted_flush(records, writer, device, &mut memory, ranges);
    }

    if memory.exposed.is_empty() {
        return 0;
    }

    // Children are snapshotted first so the memory record lock and the
    // per-child locks never interleave with packet emission.
    let children: Vec<AliasRef> = memory
        .bindings
        .values()
        .flat_map(|slot| slot.iter().copied())
        .collect();

    let mapped_offset = memory.mapped_offset;
    let mapped_len = memory.mapped_size;
    let live_ptr = memory.mapped_ptr;
    let mut total = 0u64;

    for child in children {
        let Some((handle, child_offset, child_size, accessible)) = bound_extent(records, child)
        else {
            continue;
        };
        if !accessible || child_size == 0 {
            continue;
        }

        let touched = memory.exposed.fetch_os(child_offset, child_size, false);
        if touched.is_none() {
            continue;
        }

        // Scan window, in child-relative bytes, aligned to the diff stride
        let rel_first = align_down(touched.first - child_offset, STRIDE);
        let rel_end = align_up(touched.last - child_offset + 1, STRIDE).min(child_size);

        // The mapped window must cover the child's scan window
        assert!(
            child_offset >= mapped_offset
                && child_offset + rel_end <= mapped_offset + mapped_len,
            "scan outside the mapped window"
        );

        // Live bytes come straight off the application mapping; the record
        // lock keeps the pointer valid for the duration of the scan.
        let live_base = (child_offset - mapped_offset) as usize;
        let live_window = unsafe {
            std::slice::from_raw_parts(live_ptr.add(live_base), rel_end as usize)
        };
        // shadow is indexed by absolute allocation offsets
        let shadow = memory.shadow.as_mut().unwrap();
        let shadow_window =
            &mut shadow[child_offset as usize..(child_offset + rel_end) as usize];

        let mut stream = writer.stream();
        stream.write_u8(update_tag(child.object_type) as u8);
        stream.write_handle(device);
        stream.write_handle(handle);
        let changed = stream.write_patch(shadow_window, live_window, rel_first);
        drop(stream);

        writer.stats.memory_scans.fetch_add(1, Ordering::Relaxed);
        writer
            .stats
            .memory_bytes
            .fetch_add(rel_end - rel_first, Ordering::Relaxed);
        writer
            .stats
            .memory_changed_bytes
            .fetch_add(changed, Ordering::Relaxed);
        if changed == 0 {
            writer
                .stats
                .memory_scans_unchanged
                .fetch_add(1, Ordering::Relaxed);
        } else {
            note_written(records, child, changed);
        }
        trace!(
            "scanned {:?} {} bytes {}..{}, {changed} changed",
            child.object_type,
            child.index,
            rel_first,
            rel_end
        );
        total += changed;
    }

    memory.exposed.clear();

    total
}

/// The trusted path: record the listed bytes verbatim, no scan. Behaves as
/// if the listed ranges were the complete delta; anything not listed is
/// dropped from the capture.
fn trusted_flush(
    records: &TraceRecords,
    writer: &ThreadWriter,
    device: WireHandle,
    memory: &mut MemoryRecord,
    ranges: &[MarkedRange],
) -> u64 {
    let children: Vec<AliasRef> = memory
        .bindings
        .values()
        .flat_map(|slot| slot.iter().copied())
        .collect();
    let mapped_offset = memory.mapped_offset;
    let mut total = 0u64;

    debug!(
        "trusted flush of memory {} with {} marked ranges",
        memory.base.index,
        ranges.len()
    );

    for child in children {
        let Some((handle, child_offset, child_size, accessible)) = bound_extent(records, child)
        else {
            continue;
        };
        if !accessible {
            continue;
        }

        for range in ranges {
            let first = range.offset.max(child_offset);
            let last = (range.offset + range.size).min(child_offset + child_size);
            if first >= last {
                continue;
            }

            // A window starting at the child's base, so patch offsets come
            // out child-relative.
            let len = (last - child_offset) as usize;
            let live_base = (child_offset - mapped_offset) as usize;
            let live_window = unsafe {
                std::slice::from_raw_parts(memory.mapped_ptr.add(live_base), len)
            };

            let mut stream = writer.stream();
            stream.write_u8(update_tag(child.object_type) as u8);
            stream.write_handle(device);
            stream.write_handle(handle);
            stream.write_memory(live_window, first - child_offset, last - first);
            drop(stream);

            let copied = (last - first) as usize;
            let shadow = memory.shadow.as_mut().unwrap();
            shadow[first as usize..last as usize]
                .copy_from_slice(&live_window[(first - child_offset) as usize..]);
            total += copied as u64;

            writer.stats.memory_dumps.fetch_add(1, Ordering::Relaxed);
            note_written(records, child, copied as u64);
        }
    }

    memory.exposed.clear();

    total
}
