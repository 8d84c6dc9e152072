//! Property tests for the inbound stream buffer
//!
//! Segment boundaries must never show through: any sequence of pushes,
//! cursor-resumed copies and releases reads the same bytes as one flat
//! vector would.

use bytes::Bytes;
use common::Error;
use proptest::prelude::*;
use vhci::InboundStreamBuffer;

/// Segment lengths for a buffer of up to a few hundred bytes
fn segment_lengths() -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::vec(1usize..=48, 1..12)
}

/// Consumer read sizes; zero-length reads included
fn read_sizes() -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::vec(0usize..=32, 1..24)
}

fn fill(lengths: &[usize]) -> (InboundStreamBuffer, Vec<u8>) {
    let mut buf = InboundStreamBuffer::new();
    let mut flat = Vec::new();
    let mut next = 0u8;
    for len in lengths {
        let seg: Vec<u8> = (0..*len)
            .map(|_| {
                next = next.wrapping_add(7);
                next
            })
            .collect();
        flat.extend_from_slice(&seg);
        buf.push(Bytes::from(seg));
    }
    (buf, flat)
}

proptest! {
    /// Property: a cursor-resumed sequence of reads equals one flat copy
    #[test]
    fn prop_resumed_reads_match_flat(lengths in segment_lengths(), reads in read_sizes()) {
        let (buf, flat) = fill(&lengths);

        let mut out = Vec::new();
        let mut cursor = None;
        let mut offset = 0;
        for n in reads {
            let n = n.min(flat.len() - offset);
            let mut dest = vec![0u8; n];
            let next = buf.copy(&mut dest, offset, cursor.as_ref()).unwrap();
            prop_assert_eq!(next.position(), offset + n);
            out.extend_from_slice(&dest);
            offset += n;
            cursor = Some(next);
        }

        prop_assert_eq!(&out[..], &flat[..offset]);
    }

    /// Property: an arbitrary range reads the same bytes as the flat vector
    #[test]
    fn prop_random_range(lengths in segment_lengths(), start in 0usize..600, len in 0usize..600) {
        let (buf, flat) = fill(&lengths);
        let mut dest = vec![0u8; len];
        let result = buf.copy(&mut dest, start, None);

        if start + len <= flat.len() {
            prop_assert!(result.is_ok());
            prop_assert_eq!(&dest[..], &flat[start..start + len]);
        } else {
            let is_insufficient = matches!(result, Err(Error::InsufficientData { .. }));
            prop_assert!(is_insufficient);
        }
    }

    /// Property: release keeps size equal to pushed minus released
    #[test]
    fn prop_release_tracks_size(lengths in segment_lengths(), releases in read_sizes()) {
        let (mut buf, flat) = fill(&lengths);
        let mut released = 0;

        for n in releases {
            let n = n.min(buf.size());
            buf.release(n).unwrap();
            released += n;
            prop_assert_eq!(buf.size(), flat.len() - released);
        }

        let mut rest = vec![0u8; buf.size()];
        buf.copy(&mut rest, 0, None).unwrap();
        prop_assert_eq!(&rest[..], &flat[released..]);
    }

    /// Property: over-release is rejected without side effects
    #[test]
    fn prop_over_release_rejected(lengths in segment_lengths(), extra in 1usize..64) {
        let (mut buf, flat) = fill(&lengths);
        let segments = buf.segment_count();

        prop_assert!(buf.release(flat.len() + extra).is_err());
        prop_assert_eq!(buf.size(), flat.len());
        prop_assert_eq!(buf.segment_count(), segments);
    }
}

#[test]
fn test_header_then_payload_reassembly() {
    // A 48-byte header split across three segments, followed by its payload
    let mut buf = InboundStreamBuffer::new();
    let mut message = vec![0u8; 48];
    message[44..48].copy_from_slice(&16u32.to_be_bytes());
    message.extend(std::iter::repeat_n(0xEE, 16));

    buf.push(Bytes::copy_from_slice(&message[..10]));
    buf.push(Bytes::copy_from_slice(&message[10..30]));

    let mut header = [0u8; 48];
    assert!(matches!(
        buf.copy(&mut header, 0, None),
        Err(Error::InsufficientData { requested: 48, available: 30 })
    ));

    buf.push(Bytes::copy_from_slice(&message[30..]));
    let cursor = buf.copy(&mut header, 0, None).unwrap();
    let payload_len = u32::from_be_bytes([header[44], header[45], header[46], header[47]]) as usize;

    let mut payload = vec![0u8; payload_len];
    buf.copy(&mut payload, 48, Some(&cursor)).unwrap();
    assert!(payload.iter().all(|b| *b == 0xEE));

    buf.release(48 + payload_len).unwrap();
    assert!(buf.is_empty());
}
