//! Tests for the session controller against a scripted in-memory link

#[cfg(test)]
mod tests {
    use midds_core::channel::{InputOptions, ModeSettings, Reading};
    use midds_core::config::{ChannelConfig, ProgramConfig};
    use midds_core::protocol::{
        ChannelMode, DeviceLink, Level, Message, ProtocolError, SignalType, CHANNEL_COUNT,
    };
    use midds_core::session::{ControllerTimings, SessionController, SessionState};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// What the scripted device has seen and will answer
    #[derive(Default)]
    struct Script {
        written: Vec<u8>,
        inbox: VecDeque<u8>,
        reject_channel: Option<u8>,
        broken: bool,
    }

    #[derive(Clone, Default)]
    struct ScriptedLink(Arc<Mutex<Script>>);

    impl ScriptedLink {
        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.0.lock().unwrap()
        }

        fn reply(&self, bytes: &[u8]) {
            self.script().inbox.extend(bytes);
        }

        fn written(&self) -> Vec<u8> {
            self.script().written.clone()
        }

        fn broken_pipe() -> io::Error {
            io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut script = self.script();
            if script.broken {
                return Err(Self::broken_pipe());
            }
            let n = buf.len().min(script.inbox.len());
            for (slot, byte) in buf.iter_mut().zip(script.inbox.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut script = self.script();
            if script.broken {
                return Err(Self::broken_pipe());
            }
            script.written.extend_from_slice(buf);
            if buf.starts_with(b"$CONN") {
                script.inbox.extend(b"PROTO MIDDS ready\n");
            }
            if let Some(rejected) = script.reject_channel {
                if buf.starts_with(format!("$SC{:02}", rejected).as_bytes()) {
                    let reply = Message::Error {
                        text: "RR_INVALID_MODE".to_string(),
                    };
                    script.inbox.extend(reply.encode().unwrap());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl DeviceLink for ScriptedLink {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            let script = self.script();
            if script.broken {
                return Err(Self::broken_pipe());
            }
            Ok(script.inbox.len() as u32)
        }
    }

    fn config(dir: &std::path::Path) -> ProgramConfig {
        let mut config = ProgramConfig {
            serial_port: Some("scripted".to_string()),
            recordings_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        config.channels[5] = ChannelConfig {
            number: 5,
            name: "button".to_string(),
            signal: SignalType::Ttl,
            settings: ModeSettings::Input(InputOptions::default()),
        };
        config.channels[9] = ChannelConfig {
            number: 9,
            name: "led".to_string(),
            signal: SignalType::Ttl,
            settings: ModeSettings::Output(Default::default()),
        };
        config
    }

    fn controller(config: &ProgramConfig, link: &ScriptedLink) -> SessionController {
        let link = link.clone();
        SessionController::new(
            config,
            Box::new(move |_, _| Ok(Box::new(link.clone()) as Box<dyn DeviceLink>)),
        )
        .with_timings(ControllerTimings::immediate())
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_rejected_channel_does_not_abort_push() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        link.script().reject_channel = Some(3);

        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();
        session.open();
        controller.tick();

        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_connected());

        let written = link.written();
        assert!(written.starts_with(b"$CONN"));
        assert_eq!(count(&written, b"$SC"), CHANNEL_COUNT);
        assert_eq!(count(&written, b"$SY-1"), 2);

        for snapshot in session.snapshots() {
            assert_eq!(
                snapshot.well_configured,
                snapshot.number != 3,
                "channel {}",
                snapshot.number
            );
        }

        let error = session.take_error().unwrap();
        assert_eq!(error.title, "MIDDS Error");
        assert!(error.body.contains("RR_INVALID_MODE"));
    }

    #[test]
    fn test_recurring_requests_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();

        let written = link.written();
        let level_request = Message::input_request(5).encode().unwrap();
        let readback_request = Message::input_request(9).encode().unwrap();
        assert_eq!(count(&written, &level_request), 1);
        assert_eq!(count(&written, &readback_request), 1);

        link.reply(
            &Message::Input {
                channel: 5,
                level: Some(Level::High),
                time: 1_000,
            }
            .encode()
            .unwrap(),
        );
        controller.tick();

        let snapshot = session.snapshot(5).unwrap();
        assert_eq!(snapshot.level, Reading::Known(Level::High));
        assert_eq!(session.decoder_stats().frames, 1);
    }

    #[test]
    fn test_output_level_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();
        session.set_output_level(9, Level::High).unwrap();
        controller.tick();

        let frame = Message::Output {
            channel: 9,
            level: Level::High,
            time: 0,
        }
        .encode()
        .unwrap();
        assert_eq!(count(&link.written(), &frame), 1);
        assert!(matches!(
            session.set_output_level(20, Level::Low),
            Err(ProtocolError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_link_failure_forces_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();
        assert!(session.is_connected());

        link.script().broken = true;
        controller.tick();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert_eq!(session.take_error().unwrap().title, "Serial port error");

        // The loop keeps serving requests
        link.script().broken = false;
        session.open();
        controller.tick();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_open_failure_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::new(
            &config(dir.path()),
            Box::new(|port, _| Err(ProtocolError::SerialError(format!("{} not found", port)))),
        )
        .with_timings(ControllerTimings::immediate());
        let session = controller.handle();

        session.open();
        controller.tick();

        assert_eq!(session.state(), SessionState::Disconnected);
        let error = session.take_error().unwrap();
        assert_eq!(error.title, "Serial port error");
        assert!(error.body.contains("scripted not found"));
    }

    #[test]
    fn test_close_sends_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();
        session.close();
        controller.tick();

        assert!(link.written().ends_with(b"$DISC"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_recording_captures_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();

        session.start_recording();
        let recorded = Message::Input {
            channel: 5,
            level: Some(Level::Low),
            time: 77,
        }
        .encode()
        .unwrap();
        link.reply(&recorded[..6]);
        controller.tick();
        link.reply(&recorded[6..]);
        controller.tick();
        assert!(session.is_recording());
        assert_eq!(session.take_message().unwrap().title, "Started recording");

        session.stop_recording();
        link.reply(b"$I051after");
        controller.tick();

        assert!(!session.is_recording());
        assert_eq!(session.take_message().unwrap().title, "Stopped recording");
        let path = session.recording_path().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), recorded);
    }

    #[test]
    fn test_close_without_link_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::new(
            &config(dir.path()),
            Box::new(|port, _| Err(ProtocolError::SerialError(format!("{} not found", port)))),
        )
        .with_timings(ControllerTimings::immediate());
        let session = controller.handle();

        session.start_recording();
        controller.tick();
        assert!(session.is_recording());
        assert_eq!(session.take_message().unwrap().title, "Started recording");

        session.close();
        controller.tick();
        assert!(session.is_recording());
        assert!(session.take_message().is_none());

        session.stop_recording();
        controller.tick();
        assert!(!session.is_recording());
    }

    #[test]
    fn test_close_of_connected_session_stops_recording() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        session.start_recording();
        controller.tick();
        assert!(session.is_recording());
        assert_eq!(session.take_message().unwrap().title, "Started recording");

        session.close();
        controller.tick();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_recording());
        assert_eq!(session.take_message().unwrap().title, "Stopped recording");
    }

    #[test]
    fn test_queued_commands_follow_the_poll() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();
        session.set_update_interval(Duration::ZERO);
        let already_written = link.written().len();

        session.set_output_level(9, Level::Low).unwrap();
        controller.tick();

        let written = link.written()[already_written..].to_vec();
        let request = Message::input_request(5).encode().unwrap();
        let command = Message::Output {
            channel: 9,
            level: Level::Low,
            time: 0,
        }
        .encode()
        .unwrap();
        let position = |needle: &[u8]| written.windows(needle.len()).position(|w| w == needle);
        let request_at = position(&request).unwrap();
        let command_at = position(&command).unwrap();
        assert!(request_at < command_at);
    }

    #[test]
    fn test_channel_edits_apply_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let link = ScriptedLink::default();
        let mut controller = controller(&config(dir.path()), &link);
        let session = controller.handle();

        session.open();
        controller.tick();

        assert!(session.set_channel_mode(7, ChannelMode::MonitorBoth));
        assert!(!session.snapshot(7).unwrap().well_configured);

        session.apply_channels();
        controller.tick();
        assert!(session.snapshot(7).unwrap().well_configured);
        assert!(link.written().windows(8).any(|w| w == b"$SC07MBT"));
    }
}
