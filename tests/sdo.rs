use canbridge::error::{AbortKind, ABORT_OUT_OF_RANGE, ABORT_UNKNOWN_INDEX};
use canbridge::sdo::{
    self, SdoResponse, UploadPayload, INDEX_SERIAL, INDEX_STRINGS,
};
use canbridge::Frame;

fn response(node: u8, data: [u8; 8]) -> Frame {
    Frame::new(0x580 | node as u16, &data).unwrap()
}

#[test]
fn upload_request_layout() {
    let frame = sdo::upload_request(3, INDEX_SERIAL, 2);
    assert_eq!(frame.id, 0x603);
    assert_eq!(frame.data[0], 0x40);
    assert_eq!(u16::from_le_bytes([frame.data[1], frame.data[2]]), 0x5000);
    assert_eq!(frame.data[3], 2);
    assert_eq!(&frame.data[4..], &[0, 0, 0, 0]);
}

#[test]
fn download_request_layout() {
    let frame = sdo::download_request(0x10, 0x2101, 0x42, 0xDEAD_BEEF);
    assert_eq!(frame.id, 0x610);
    // expedited, sized, 4 bytes
    assert_eq!(frame.data[0], 0x23);
    assert_eq!(u16::from_le_bytes([frame.data[1], frame.data[2]]), 0x2101);
    assert_eq!(frame.data[3], 0x42);
    assert_eq!(
        u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]),
        0xDEAD_BEEF
    );
}

#[test]
fn segment_request_carries_toggle_in_bit_4() {
    assert_eq!(sdo::segment_request(1, false).data[0], 0x60);
    assert_eq!(sdo::segment_request(1, true).data[0], 0x70);
}

#[test]
fn abort_request_layout() {
    let frame = sdo::abort_request(9, 0x5001, 0, ABORT_OUT_OF_RANGE);
    assert_eq!(frame.id, 0x609);
    assert_eq!(frame.data[0], 0x80);
    assert_eq!(
        u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]),
        ABORT_OUT_OF_RANGE
    );
}

#[test]
fn parses_expedited_upload_response() {
    let mut data = [0u8; 8];
    data[0] = 0x43;
    data[1..3].copy_from_slice(&0x5000u16.to_le_bytes());
    data[3] = 1;
    data[4..8].copy_from_slice(&0x3231_5110u32.to_le_bytes());
    let (node, resp) = sdo::parse_response(&response(3, data)).unwrap();
    assert_eq!(node, 3);
    match resp {
        SdoResponse::UploadInitiate { index, sub, payload } => {
            assert_eq!((index, sub), (0x5000, 1));
            assert_eq!(payload.as_u32(), Some(0x3231_5110));
        }
        other => panic!("wrong shape: {other:?}"),
    }
}

#[test]
fn parses_partial_expedited_length() {
    // 2 bytes used: cmd = 0x40 | expedited | sized | ((4-2) << 2)
    let mut data = [0u8; 8];
    data[0] = 0x4B;
    data[4] = 0x34;
    data[5] = 0x12;
    let (_, resp) = sdo::parse_response(&response(1, data)).unwrap();
    match resp {
        SdoResponse::UploadInitiate {
            payload: UploadPayload::Expedited { data, len },
            ..
        } => {
            assert_eq!(len, 2);
            assert_eq!(data, [0x34, 0x12, 0, 0]);
        }
        other => panic!("wrong shape: {other:?}"),
    }
}

#[test]
fn parses_segmented_initiate_with_size() {
    let mut data = [0u8; 8];
    data[0] = 0x41;
    data[1..3].copy_from_slice(&INDEX_STRINGS.to_le_bytes());
    data[4..8].copy_from_slice(&1234u32.to_le_bytes());
    let (_, resp) = sdo::parse_response(&response(3, data)).unwrap();
    match resp {
        SdoResponse::UploadInitiate {
            payload: UploadPayload::Segmented { size },
            ..
        } => assert_eq!(size, Some(1234)),
        other => panic!("wrong shape: {other:?}"),
    }
}

#[test]
fn parses_segment_with_toggle_and_length() {
    // toggle set, 3 payload bytes (free = 4), not last
    let mut data = [0u8; 8];
    data[0] = 0x10 | (4 << 1);
    data[1..4].copy_from_slice(b"abc");
    let (_, resp) = sdo::parse_response(&response(3, data)).unwrap();
    match resp {
        SdoResponse::Segment(seg) => {
            assert!(seg.toggle);
            assert!(!seg.last);
            assert_eq!(seg.data, b"abc");
        }
        other => panic!("wrong shape: {other:?}"),
    }
}

#[test]
fn parses_terminal_segment() {
    // last bit set, full 7 bytes
    let mut data = [0u8; 8];
    data[0] = 0x01;
    data[1..8].copy_from_slice(b"payload");
    let (_, resp) = sdo::parse_response(&response(3, data)).unwrap();
    match resp {
        SdoResponse::Segment(seg) => {
            assert!(seg.last);
            assert!(!seg.toggle);
            assert_eq!(seg.data, b"payload");
        }
        other => panic!("wrong shape: {other:?}"),
    }
}

#[test]
fn parses_abort_and_classifies_codes() {
    let mut data = [0u8; 8];
    data[0] = 0x80;
    data[1..3].copy_from_slice(&0x2101u16.to_le_bytes());
    data[4..8].copy_from_slice(&ABORT_UNKNOWN_INDEX.to_le_bytes());
    let (_, resp) = sdo::parse_response(&response(7, data)).unwrap();
    assert_eq!(resp.abort_kind(), Some(AbortKind::UnknownIndex));

    data[4..8].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    let (_, resp) = sdo::parse_response(&response(7, data)).unwrap();
    assert_eq!(resp.abort_kind(), Some(AbortKind::Generic));
}

#[test]
fn response_echo_is_address_sensitive() {
    let mut data = [0u8; 8];
    data[0] = 0x43;
    data[1..3].copy_from_slice(&0x5000u16.to_le_bytes());
    data[3] = 1;
    let (_, resp) = sdo::parse_response(&response(3, data)).unwrap();
    assert!(resp.echoes(0x5000, 1));
    assert!(!resp.echoes(0x5000, 2));
    assert!(!resp.echoes(0x5001, 1));
}

#[test]
fn rejects_frames_outside_the_response_window() {
    let frame = Frame::new(0x600, &[0x40, 0, 0, 0, 0, 0, 0, 0]).unwrap();
    assert!(sdo::parse_response(&frame).is_err());
    let frame = Frame::new(0x7DE, &[b'P']).unwrap();
    assert!(sdo::parse_response(&frame).is_err());
}

#[test]
fn rejects_short_responses() {
    let frame = Frame::new(0x583, &[0x43, 0, 0]).unwrap();
    assert!(sdo::parse_response(&frame).is_err());
}
