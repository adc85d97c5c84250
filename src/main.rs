//! cfw-sim: boots the simulated two-core platform
//!
//! A sensor service lives on the slave and publishes a sample every 100 ms.
//! A client on the master waits for it, opens it, subscribes to the samples
//! and finally asks the service manager to shut the platform down.

use std::ops::ControlFlow;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, LevelFilter};

use cfw::cfw::service::ConnPriv;
use cfw::cfw::{msg_id, ConnInfo, Service, ServiceConnection, Status};
use cfw::clock::{Clock, StdClock};
use cfw::{logger, CpuId, Message, MsgId, Platform, ServiceId};

const SENSOR_SVC: ServiceId = ServiceId(10);
const SAMPLE_EVT: MsgId = 0x0100;
const SAMPLES: u32 = 5;

static LOG_CLOCK: spin::Once<StdClock> = spin::Once::new();

fn log_time() -> u64 {
    LOG_CLOCK.get().map_or(0, |c| c.now_ms())
}

struct Sensor;

impl Service for Sensor {
    fn client_connected(&self, conn: &ConnInfo) -> Option<ConnPriv> {
        info!("sensor: client on {} connected as {:?}", conn.client_port, conn.id);
        None
    }

    fn registered_events_changed(&self, conn: &ConnInfo, events: &[MsgId]) {
        info!("sensor: {:?} subscribed to {:x?}", conn.id, events);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let platform = Platform::builder()
        .clock(Arc::new(StdClock::new()))
        .build()?;
    let master = platform.master().clone();
    let slave = platform
        .core(CpuId(1))
        .ok_or("platform has no slave core")?
        .clone();

    let stop = Arc::new(AtomicBool::new(false));
    let stopper = stop.clone();
    platform
        .manager()
        .on_shutdown_complete(Box::new(move |status: Status| {
            info!("platform shutdown finished: {}", status);
            stopper.store(true, Ordering::Release);
        }));

    // client on the master
    let cpu = master.cpu().clone();
    let client = master.client(Arc::new(move |msg: Message| {
        match msg.id() {
            SAMPLE_EVT => {
                let value = msg
                    .body()
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_le_bytes);
                info!("client: sample {:?} from {}", value, msg.src());
            }
            msg_id::SHUTDOWN_RSP => info!("client: shutdown acknowledged"),
            other => info!("client: message {:#x}", other),
        }
        cpu.free_message(msg);
    }))?;
    client.open_service_helper(
        SENSOR_SVC,
        &[SAMPLE_EVT],
        1,
        Box::new(|result: Result<ServiceConnection, Status>| match result {
            Ok(conn) => info!("client: connected to {} on {}", conn.service_id, conn.cpu),
            Err(status) => error!("client: open failed: {}", status),
        }),
    )?;

    // sensor on the slave
    let port = slave.alloc_port()?;
    slave
        .broker()
        .register_service(SENSOR_SVC, port, Arc::new(Sensor))?;
    let broker = slave.broker().clone();
    let mut sent = 0u32;
    slave.xloop().post_func_periodic(100, move || {
        sent += 1;
        let sample = 20 + sent;
        broker.send_event(SENSOR_SVC, Message::with_body(SAMPLE_EVT, &sample.to_le_bytes()));
        if sent == SAMPLES {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    let threads = platform.spawn_loops(stop.clone());
    std::thread::sleep(Duration::from_millis(100 * (SAMPLES as u64 + 2)));
    client.request_shutdown(7)?;
    for t in threads {
        let _ = t.join();
    }

    for (cpu, stats) in platform.stats().iter().enumerate() {
        info!("cpu{}: {:?}", cpu, stats);
    }
    Ok(())
}

fn main() -> ExitCode {
    LOG_CLOCK.call_once(StdClock::new);
    logger::set_time_source(log_time);
    logger::init_stderr(LevelFilter::Info);
    info!("{} v{} simulator", cfw::NAME, cfw::VERSION);

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("simulation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
