//! Ping-pong between a master and a remote in one process.
//!
//! This example shows:
//! - Sizing and allocating a shared region for a configuration
//! - Bringing up a master and a remote over socketpair doorbells
//! - Endpoints whose handlers reply from the receive path
//! - Blocking sends and link statistics
//!
//! Run with: `cargo run --example pingpong -p rpmsg`
//! Set `RUST_LOG=rpmsg_transport_shm=trace` to watch the rings.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rpmsg::prelude::*;
use rpmsg::transport::shm::DoorbellPlatform;
use tracing_subscriber::EnvFilter;

const PING_ADDR: u32 = 30;
const PONG_ADDR: u32 = 31;
const ROUNDS: u32 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ShmConfig::default()
        .with_buffer_count(4)
        .with_vring_align(16)
        .with_link_timeout(Timeout::After(Duration::from_secs(1)));
    let shm = SharedMemory::new(config.region_size()?)?;

    // One doorbell per side, each with its own ISR task.
    let (master_pf, remote_pf) = DoorbellPlatform::pair()?;
    master_pf.spawn();
    remote_pf.spawn();

    let master = RpmsgLite::master_init(shm.clone(), 0, config.clone(), master_pf.clone())?;

    // remote_init waits for the link, so keep it off the runtime threads.
    let remote = tokio::task::spawn_blocking(move || {
        RpmsgLite::remote_init(shm, 0, config, remote_pf)
    })
    .await??;
    println!(
        "link up: master={} remote={}",
        master.is_link_up(),
        remote.is_link_up()
    );

    // Remote: answer every ping with the value plus one.
    let pong_ept: Arc<Mutex<Option<Endpoint>>> = Arc::new(Mutex::new(None));
    let ept = {
        let responder = remote.clone();
        let pong_ept = pong_ept.clone();
        remote.create_ept(PONG_ADDR, move |msg: RxBuffer| {
            let value = read_u32(&msg);
            let reply_to = msg.src();
            drop(msg);
            if let Some(ept) = pong_ept.lock().as_ref() {
                let reply = (value + 1).to_le_bytes();
                if let Err(e) = responder.send(ept, reply_to, &reply, Timeout::NonBlocking) {
                    eprintln!("pong failed: {}", e);
                }
            }
        })?
    };
    *pong_ept.lock() = Some(ept);

    // Master: forward pongs to the main task.
    let (tx, rx) = mpsc::channel::<u32>();
    let tx = Mutex::new(tx);
    let ping_ept = master.create_ept(PING_ADDR, move |msg: RxBuffer| {
        let _ = tx.lock().send(read_u32(&msg));
    })?;

    for round in 0..ROUNDS {
        let ping = round * 2;
        let wait = Timeout::After(Duration::from_millis(100));
        master.send(&ping_ept, PONG_ADDR, &ping.to_le_bytes(), wait)?;
        let pong = tokio::task::block_in_place(|| rx.recv_timeout(Duration::from_secs(1)))?;
        println!("ping {} -> pong {}", ping, pong);
    }

    println!("master: {:?}", master.stats());
    println!("remote: {:?}", remote.stats());

    remote.deinit()?;
    master.deinit()?;
    master_pf.close();
    Ok(())
}

fn read_u32(msg: &RxBuffer) -> u32 {
    let mut word = [0u8; 4];
    let n = msg.len().min(4);
    word[..n].copy_from_slice(&msg.payload()[..n]);
    u32::from_le_bytes(word)
}
