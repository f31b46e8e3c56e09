//! Multi-frame relay packet layout.
//!
//! ```text
//! offset 0              frame_count   u8
//! offset 1              generation    u8 (wraps mod 256)
//! offset 2              offsets       frame_count × u16 LE, cumulative
//! offset 2+2×count      frame bytes   concatenated Opus frames
//! ```
//!
//! Offsets are cumulative byte lengths measured from the end of the header.
//! A frame whose offset equals the previous one is empty and carries no audio.

use crate::error::{Result, VoxsyncError};

/// Bytes before the offset table: frame count + generation.
pub const HEADER_PREFIX_LEN: usize = 2;

/// Size of one offset table entry.
pub const OFFSET_LEN: usize = 2;

/// Header length for a packet carrying `frame_count` frames.
pub const fn header_len(frame_count: usize) -> usize {
    HEADER_PREFIX_LEN + OFFSET_LEN * frame_count
}

/// Writes the fixed prefix of a packet header.
pub fn write_prefix(packet: &mut [u8], frame_count: u8, generation: u8) {
    packet[0] = frame_count;
    packet[1] = generation;
}

/// Writes the cumulative offset for frame `index`.
pub fn write_offset(packet: &mut [u8], index: usize, offset: u16) {
    let at = HEADER_PREFIX_LEN + OFFSET_LEN * index;
    packet[at..at + OFFSET_LEN].copy_from_slice(&offset.to_le_bytes());
}

/// A validated, borrowed view over an encoded packet.
///
/// Construction scans the whole offset table before any frame byte is
/// touched, so a view can only exist for a packet whose declared frames lie
/// inside the buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    generation: u8,
    frame_count: usize,
    offsets: &'a [u8],
    payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Validate `packet` and return a view over its frames.
    ///
    /// # Errors
    /// `VoxsyncError::CorruptPacket` when the header is truncated, declares
    /// more than `max_frames` frames, carries decreasing offsets, or declares
    /// more compressed bytes than the packet holds.
    pub fn parse(packet: &'a [u8], max_frames: usize) -> Result<Self> {
        if packet.len() < HEADER_PREFIX_LEN {
            return Err(VoxsyncError::CorruptPacket(format!(
                "{} byte(s) is shorter than the {HEADER_PREFIX_LEN}-byte prefix",
                packet.len()
            )));
        }

        let frame_count = usize::from(packet[0]);
        let generation = packet[1];

        if frame_count > max_frames {
            return Err(VoxsyncError::CorruptPacket(format!(
                "{frame_count} frames declared, capacity is {max_frames}"
            )));
        }

        let header_len = header_len(frame_count);
        if packet.len() < header_len {
            return Err(VoxsyncError::CorruptPacket(format!(
                "header needs {header_len} bytes, packet has {}",
                packet.len()
            )));
        }

        let offsets = &packet[HEADER_PREFIX_LEN..header_len];
        let mut previous = 0u16;
        for (index, pair) in offsets.chunks_exact(OFFSET_LEN).enumerate() {
            let offset = u16::from_le_bytes([pair[0], pair[1]]);
            if offset < previous {
                return Err(VoxsyncError::CorruptPacket(format!(
                    "offset {index} ({offset}) is below the previous offset ({previous})"
                )));
            }
            previous = offset;
        }

        let declared = usize::from(previous);
        let available = packet.len() - header_len;
        if declared > available {
            return Err(VoxsyncError::CorruptPacket(format!(
                "{declared} compressed bytes declared, {available} follow the header"
            )));
        }

        Ok(Self {
            generation,
            frame_count,
            offsets,
            payload: &packet[header_len..header_len + declared],
        })
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Total compressed bytes covered by the offset table.
    pub fn compressed_len(&self) -> usize {
        self.payload.len()
    }

    /// Iterate frame payloads in order. Empty slices mark skipped frames.
    pub fn frames(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let payload = self.payload;
        let offsets = self.offsets;
        let mut start = 0usize;
        offsets.chunks_exact(OFFSET_LEN).map(move |pair| {
            let end = usize::from(u16::from_le_bytes([pair[0], pair[1]]));
            let frame = &payload[start..end];
            start = end;
            frame
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(generation: u8, frames: &[&[u8]]) -> Vec<u8> {
        let mut packet = vec![0u8; header_len(frames.len())];
        write_prefix(&mut packet, frames.len() as u8, generation);
        let mut cumulative = 0u16;
        for (index, frame) in frames.iter().enumerate() {
            cumulative += frame.len() as u16;
            write_offset(&mut packet, index, cumulative);
            packet.extend_from_slice(frame);
        }
        packet
    }

    #[test]
    fn parses_frames_in_order() {
        let packet = build(9, &[&[1, 2, 3], &[4], &[5, 6]]);
        let view = PacketView::parse(&packet, 50).expect("valid packet");
        assert_eq!(view.generation(), 9);
        assert_eq!(view.frame_count(), 3);
        assert_eq!(view.compressed_len(), 6);
        let frames: Vec<&[u8]> = view.frames().collect();
        assert_eq!(frames, vec![&[1u8, 2, 3][..], &[4][..], &[5, 6][..]]);
    }

    #[test]
    fn repeated_offset_yields_empty_frame() {
        let packet = build(0, &[&[], &[7, 8], &[]]);
        let view = PacketView::parse(&packet, 50).expect("valid packet");
        let lens: Vec<usize> = view.frames().map(<[u8]>::len).collect();
        assert_eq!(lens, vec![0, 2, 0]);
    }

    #[test]
    fn empty_packet_with_zero_frames_is_valid() {
        let packet = [0u8, 4];
        let view = PacketView::parse(&packet, 50).expect("zero-frame packet");
        assert_eq!(view.frame_count(), 0);
        assert_eq!(view.frames().count(), 0);
    }

    #[test]
    fn rejects_truncated_prefix_and_offset_table() {
        assert!(PacketView::parse(&[], 50).is_err());
        assert!(PacketView::parse(&[1], 50).is_err());
        // Declares 3 frames but only one offset entry follows.
        assert!(PacketView::parse(&[3, 0, 1, 0], 50).is_err());
    }

    #[test]
    fn rejects_decreasing_offsets() {
        let mut packet = build(1, &[&[1, 2, 3], &[4, 5]]);
        write_offset(&mut packet, 1, 2);
        let err = PacketView::parse(&packet, 50).expect_err("non-monotonic offsets");
        assert!(matches!(err, VoxsyncError::CorruptPacket(_)));
    }

    #[test]
    fn rejects_declared_size_past_end_of_buffer() {
        let mut packet = build(1, &[&[1, 2, 3]]);
        write_offset(&mut packet, 0, 400);
        assert!(PacketView::parse(&packet, 50).is_err());
    }

    #[test]
    fn rejects_frame_count_above_capacity() {
        let frames: Vec<&[u8]> = vec![&[1]; 4];
        let packet = build(0, &frames);
        assert!(PacketView::parse(&packet, 3).is_err());
        assert!(PacketView::parse(&packet, 4).is_ok());
    }
}
