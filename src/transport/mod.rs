//! Topic-framed messaging over broker-less ZeroMQ pub/sub
//!
//! A message is a single frame: the ASCII topic, one space, then the
//! payload. SUB sockets prefix-match on the frame start, so subscribing
//! to `data_abcd_waveforms_v0` matches every size-suffixed topic.
//! Receives never block: with no message pending the caller gets
//! `Ok(None)` and the state machine moves on to its idle successor.

use crate::common::PipelineResult;

/// Compose the wire frame for a topic and payload.
pub fn compose_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(topic.len() + 1 + payload.len());
    frame.extend_from_slice(topic.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(payload);
    frame
}

/// Split a wire frame at the first space. Topics never contain spaces;
/// a frame without one is all topic.
pub fn split_frame(frame: &[u8]) -> (String, Vec<u8>) {
    match frame.iter().position(|&byte| byte == b' ') {
        Some(position) => (
            String::from_utf8_lossy(&frame[..position]).into_owned(),
            frame[position + 1..].to_vec(),
        ),
        None => (String::from_utf8_lossy(frame).into_owned(), Vec::new()),
    }
}

/// Send a topic-framed message.
pub fn send_message(socket: &zmq::Socket, topic: &str, payload: &[u8]) -> PipelineResult<()> {
    socket.send(compose_frame(topic, payload), 0)?;
    Ok(())
}

/// Non-blocking receive. Returns `Ok(None)` when no message is pending.
pub fn receive_message(socket: &zmq::Socket) -> PipelineResult<Option<(String, Vec<u8>)>> {
    match socket.recv_bytes(zmq::DONTWAIT) {
        Ok(frame) => Ok(Some(split_frame(&frame))),
        Err(zmq::Error::EAGAIN) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Non-blocking receive of an unframed message (the commands channel
/// carries bare JSON, no topic).
pub fn receive_raw(socket: &zmq::Socket) -> PipelineResult<Option<Vec<u8>>> {
    match socket.recv_bytes(zmq::DONTWAIT) {
        Ok(frame) => Ok(Some(frame)),
        Err(zmq::Error::EAGAIN) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = compose_frame("data_abcd_events_v0_s32", &[1, 2, 3]);
        let (topic, payload) = split_frame(&frame);
        assert_eq!(topic, "data_abcd_events_v0_s32");
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn frame_with_binary_payload_containing_spaces() {
        // Only the first space delimits; payload bytes equal to b' ' pass
        // through untouched.
        let payload = [b'a', b' ', b'b', 0x20, 0xFF];
        let frame = compose_frame("status_waps", &payload);
        let (topic, decoded) = split_frame(&frame);
        assert_eq!(topic, "status_waps");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn frame_without_space_is_all_topic() {
        let (topic, payload) = split_frame(b"lonely_topic");
        assert_eq!(topic, "lonely_topic");
        assert!(payload.is_empty());
    }

    #[test]
    fn send_and_receive_over_inproc_pair() {
        let context = zmq::Context::new();
        let sender = context.socket(zmq::PAIR).unwrap();
        let receiver = context.socket(zmq::PAIR).unwrap();
        receiver.bind("inproc://transport-test").unwrap();
        sender.connect("inproc://transport-test").unwrap();

        send_message(&sender, "data_abcd_waveforms_v0_s4", &[9, 8, 7, 6]).unwrap();

        // PAIR over inproc delivers synchronously once connected; poll a
        // few times to be safe.
        let mut received = None;
        for _ in 0..100 {
            if let Some(message) = receive_message(&receiver).unwrap() {
                received = Some(message);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let (topic, payload) = received.expect("message should arrive");
        assert_eq!(topic, "data_abcd_waveforms_v0_s4");
        assert_eq!(payload, vec![9, 8, 7, 6]);
    }

    #[test]
    fn raw_receive_returns_whole_frames() {
        let context = zmq::Context::new();
        let pull = context.socket(zmq::PULL).unwrap();
        let push = context.socket(zmq::PUSH).unwrap();
        pull.bind("inproc://transport-raw").unwrap();
        push.connect("inproc://transport-raw").unwrap();

        push.send(r#"{"command": "quit"}"#, 0).unwrap();

        let mut received = None;
        for _ in 0..100 {
            if let Some(payload) = receive_raw(&pull).unwrap() {
                received = Some(payload);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // The payload is untouched, spaces included.
        assert_eq!(received.unwrap(), br#"{"command": "quit"}"#);
    }

    #[test]
    fn receive_on_empty_socket_is_none() {
        let context = zmq::Context::new();
        let receiver = context.socket(zmq::PULL).unwrap();
        receiver.bind("inproc://transport-empty").unwrap();
        assert!(receive_message(&receiver).unwrap().is_none());
    }
}
