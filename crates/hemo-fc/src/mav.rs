use anyhow::{Context, Result};
use mavlink::{
    common::{
        GpsFixType, MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag,
        MavResult, MavState, MavType, COMMAND_INT_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        REQUEST_DATA_STREAM_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use hemo_proto::vehicle::{FixType, GpsFix, LandedState};
use hemo_proto::GeoPoint;

use crate::frame::{AckResult, Command, Inbound, Outbound};
use crate::link::{Connector, LinkIo};
use crate::state::Endpoint;

type SharedConn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// Gives up on a transport after this many consecutive read errors.
const MAX_READ_ERRORS: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub struct MavIds {
    pub sys_id: u8,
    pub comp_id: u8,
    pub target_sys: u8,
    pub target_comp: u8,
}

/// Opens MAVLink transports (serial or network) and bridges them to async channels.
#[derive(Debug, Clone)]
pub struct MavConnector {
    ids: MavIds,
}

impl MavConnector {
    pub fn new(ids: MavIds) -> Self {
        Self { ids }
    }
}

impl Connector for MavConnector {
    fn open(&self, endpoint: &Endpoint) -> Result<LinkIo> {
        let url = match endpoint {
            Endpoint::Serial { dev, baud } => {
                // quick validate device
                let _ = tokio_serial::new(dev, *baud)
                    .open_native_async()
                    .with_context(|| format!("open fc serial device {}", dev))?;
                format!("serial:{}:{}", dev, baud)
            }
            Endpoint::Url(u) => u.clone(),
            Endpoint::Sim => anyhow::bail!("sim endpoint needs the simulator connector"),
        };

        let conn = mavlink::connect::<MavMessage>(&url)
            .with_context(|| format!("mavlink connect {}", url))?;
        let conn: SharedConn = Arc::from(conn);
        info!("mavlink transport open: {}", url);

        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(32);

        // Reader loop in a blocking task (mavlink recv blocks).
        let reader = conn.clone();
        let target_sys = self.ids.target_sys;
        tokio::task::spawn_blocking(move || read_loop(reader, target_sys, in_tx));

        let ids = self.ids;
        tokio::task::spawn_blocking(move || write_loop(conn, ids, out_rx));

        Ok(LinkIo { tx: out_tx, rx: in_rx })
    }
}

fn read_loop(conn: SharedConn, target_sys: u8, tx: mpsc::Sender<Inbound>) {
    let mut errors = 0u32;
    loop {
        if tx.is_closed() {
            break;
        }
        match conn.recv() {
            Ok((hdr, msg)) => {
                errors = 0;
                if let Some(frame) = decode(&hdr, &msg, target_sys) {
                    if tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
            }
            Err(MessageReadError::Io(e)) => {
                errors += 1;
                if errors >= MAX_READ_ERRORS {
                    warn!("mavlink read failing, closing transport: {}", e);
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => debug!("mavlink parse error: {:?}", e),
        }
    }
    debug!("mavlink reader stopped");
}

fn write_loop(conn: SharedConn, ids: MavIds, mut rx: mpsc::Receiver<Outbound>) {
    let mut hdr = MavHeader { system_id: ids.sys_id, component_id: ids.comp_id, sequence: 0 };
    while let Some(frame) = rx.blocking_recv() {
        hdr.sequence = hdr.sequence.wrapping_add(1);
        let msg = encode(&frame, ids.target_sys, ids.target_comp);
        if let Err(e) = conn.send(&hdr, &msg) {
            warn!("mavlink send failed: {:?}", e);
        }
    }
    debug!("mavlink writer stopped");
}

fn command_long(target_sys: u8, target_comp: u8, command: MavCmd, params: [f32; 7]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: target_sys,
        target_component: target_comp,
        command,
        confirmation: 0,
        param1: params[0],
        param2: params[1],
        param3: params[2],
        param4: params[3],
        param5: params[4],
        param6: params[5],
        param7: params[6],
    })
}

pub fn encode(frame: &Outbound, target_sys: u8, target_comp: u8) -> MavMessage {
    match frame {
        Outbound::Heartbeat => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        }),
        Outbound::RequestStreams { rate_hz } => {
            MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
                req_message_rate: *rate_hz,
                target_system: target_sys,
                target_component: target_comp,
                req_stream_id: 0, // MAV_DATA_STREAM_ALL
                start_stop: 1,
            })
        }
        Outbound::Command(cmd) => encode_command(cmd, target_sys, target_comp),
    }
}

fn encode_command(cmd: &Command, ts: u8, tc: u8) -> MavMessage {
    match *cmd {
        Command::Arm => {
            let params = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
            command_long(ts, tc, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, params)
        }
        Command::Disarm => command_long(ts, tc, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7]),
        Command::SetMode(mode) => command_long(
            ts,
            tc,
            MavCmd::MAV_CMD_DO_SET_MODE,
            [
                MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                mode.custom_mode() as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        ),
        Command::Takeoff { alt_m } => {
            command_long(ts, tc, MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, alt_m])
        }
        Command::Waypoint { target, alt_m } => MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            param1: -1.0, // default ground speed
            param2: 1.0,  // MAV_DO_REPOSITION_FLAGS_CHANGE_MODE
            param3: 0.0,
            param4: f32::NAN, // keep yaw behaviour
            x: (target.lat * 1e7).round() as i32,
            y: (target.lon * 1e7).round() as i32,
            z: alt_m,
            command: MavCmd::MAV_CMD_DO_REPOSITION,
            target_system: ts,
            target_component: tc,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: 0,
            autocontinue: 0,
        }),
        Command::ReturnToLaunch => {
            command_long(ts, tc, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7])
        }
    }
}

/// Translate one autopilot message. Messages from other systems are ignored.
pub fn decode(hdr: &MavHeader, msg: &MavMessage, target_sys: u8) -> Option<Inbound> {
    if hdr.system_id != target_sys {
        return None;
    }
    match msg {
        MavMessage::HEARTBEAT(hb) => {
            if hb.autopilot == MavAutopilot::MAV_AUTOPILOT_INVALID {
                return None; // not the autopilot component
            }
            Some(Inbound::Heartbeat {
                armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                custom_mode: hb.custom_mode,
            })
        }
        MavMessage::GLOBAL_POSITION_INT(p) => {
            let vx = p.vx as f32 / 100.0;
            let vy = p.vy as f32 / 100.0;
            Some(Inbound::Position {
                position: GeoPoint::new(p.lat as f64 / 1e7, p.lon as f64 / 1e7),
                relative_alt_m: p.relative_alt as f32 / 1000.0,
                ground_speed_mps: (vx * vx + vy * vy).sqrt(),
                heading_deg: if p.hdg == u16::MAX { None } else { Some(p.hdg as f32 / 100.0) },
            })
        }
        MavMessage::SYS_STATUS(s) => {
            // battery_remaining is percentage 0-100, -1 means invalid
            let remaining = (0..=100)
                .contains(&s.battery_remaining)
                .then(|| s.battery_remaining as f32 / 100.0);
            Some(Inbound::Battery { remaining })
        }
        MavMessage::GPS_RAW_INT(g) => Some(Inbound::Gps(GpsFix {
            fix_type: fix_type(g.fix_type),
            satellites: if g.satellites_visible == u8::MAX { 0 } else { g.satellites_visible },
        })),
        MavMessage::EXTENDED_SYS_STATE(e) => landed_state(e.landed_state).map(Inbound::Landed),
        MavMessage::COMMAND_ACK(a) => Some(Inbound::Ack {
            command: a.command as u16,
            result: ack_result(a.result),
        }),
        _ => None,
    }
}

fn fix_type(t: GpsFixType) -> FixType {
    match t {
        GpsFixType::GPS_FIX_TYPE_NO_GPS => FixType::NoGps,
        GpsFixType::GPS_FIX_TYPE_2D_FIX => FixType::Fix2d,
        GpsFixType::GPS_FIX_TYPE_3D_FIX
        | GpsFixType::GPS_FIX_TYPE_STATIC
        | GpsFixType::GPS_FIX_TYPE_PPP => FixType::Fix3d,
        GpsFixType::GPS_FIX_TYPE_DGPS => FixType::Dgps,
        GpsFixType::GPS_FIX_TYPE_RTK_FLOAT => FixType::RtkFloat,
        GpsFixType::GPS_FIX_TYPE_RTK_FIXED => FixType::RtkFixed,
        _ => FixType::NoFix,
    }
}

fn landed_state(s: MavLandedState) -> Option<LandedState> {
    match s {
        MavLandedState::MAV_LANDED_STATE_ON_GROUND => Some(LandedState::OnGround),
        MavLandedState::MAV_LANDED_STATE_IN_AIR => Some(LandedState::InAir),
        MavLandedState::MAV_LANDED_STATE_TAKEOFF => Some(LandedState::Takeoff),
        MavLandedState::MAV_LANDED_STATE_LANDING => Some(LandedState::Landing),
        _ => None,
    }
}

fn ack_result(r: MavResult) -> AckResult {
    match r {
        MavResult::MAV_RESULT_ACCEPTED => AckResult::Accepted,
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => AckResult::TemporarilyRejected,
        MavResult::MAV_RESULT_DENIED => AckResult::Denied,
        MavResult::MAV_RESULT_UNSUPPORTED => AckResult::Unsupported,
        MavResult::MAV_RESULT_IN_PROGRESS => AckResult::InProgress,
        MavResult::MAV_RESULT_CANCELLED => AckResult::Cancelled,
        _ => AckResult::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::cmd_id;
    use mavlink::common::GLOBAL_POSITION_INT_DATA;

    const FC: MavHeader = MavHeader { system_id: 1, component_id: 1, sequence: 0 };

    fn autopilot_heartbeat(armed: bool, custom_mode: u32) -> MavMessage {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn decodes_armed_heartbeat() {
        let f = decode(&FC, &autopilot_heartbeat(true, 6), 1).unwrap();
        assert_eq!(f, Inbound::Heartbeat { armed: true, custom_mode: 6 });
    }

    #[test]
    fn ignores_other_systems_and_non_autopilots() {
        let other = MavHeader { system_id: 255, ..FC };
        assert!(decode(&other, &autopilot_heartbeat(false, 0), 1).is_none());
        assert!(decode(&FC, &encode(&Outbound::Heartbeat, 1, 1), 1).is_none());
    }

    #[test]
    fn decodes_global_position() {
        let msg = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 1_000,
            lat: 407_128_000,
            lon: -740_060_000,
            alt: 120_000,
            relative_alt: 30_500,
            vx: 300,
            vy: 400,
            vz: 0,
            hdg: 9_000,
        });
        match decode(&FC, &msg, 1).unwrap() {
            Inbound::Position { position, relative_alt_m, ground_speed_mps, heading_deg } => {
                assert!((position.lat - 40.7128).abs() < 1e-9);
                assert!((position.lon + 74.006).abs() < 1e-9);
                assert_eq!(relative_alt_m, 30.5);
                assert_eq!(ground_speed_mps, 5.0);
                assert_eq!(heading_deg, Some(90.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn encodes_arm_and_takeoff_as_command_long() {
        match encode(&Outbound::Command(Command::Arm), 1, 1) {
            MavMessage::COMMAND_LONG(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                assert_eq!(c.param1, 1.0);
                assert_eq!(c.command as u16, cmd_id::COMPONENT_ARM_DISARM);
            }
            other => panic!("unexpected {:?}", other),
        }
        match encode(&Outbound::Command(Command::Takeoff { alt_m: 40.0 }), 1, 1) {
            MavMessage::COMMAND_LONG(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_NAV_TAKEOFF);
                assert_eq!(c.param7, 40.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn encodes_waypoint_as_reposition() {
        let cmd = Command::Waypoint { target: GeoPoint::new(39.9042, 116.4074), alt_m: 50.0 };
        match encode(&Outbound::Command(cmd), 1, 1) {
            MavMessage::COMMAND_INT(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_DO_REPOSITION);
                assert_eq!(c.command as u16, cmd.wire_id());
                assert_eq!(c.x, 399_042_000);
                assert_eq!(c.y, 1_164_074_000);
                assert_eq!(c.z, 50.0);
                assert_eq!(c.frame, MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wire_ids_match_mavlink() {
        assert_eq!(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH as u16, cmd_id::NAV_RETURN_TO_LAUNCH);
        assert_eq!(MavCmd::MAV_CMD_NAV_TAKEOFF as u16, cmd_id::NAV_TAKEOFF);
        assert_eq!(MavCmd::MAV_CMD_DO_SET_MODE as u16, cmd_id::DO_SET_MODE);
    }
}
