use bytes::BytesMut;
use spur_gateway::core::{GatewayConfig, HalfSeconds};
use spur_gateway::protocol::{Frame, FunctionCode, RadioCodec};
use spur_gateway::util::init_tracing;
use spur_gateway::{run, Gateway, InboundEvent, ManagementCommand, ManagementEvent, RadioCommand};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder};
use tracing::Level;

const NODE_ID: u32 = 42;

#[tokio::main]
async fn main() {
    init_tracing(Level::INFO);

    let config = GatewayConfig {
        rng_seed: Some(7),
        ..GatewayConfig::default()
    };
    println!("Gateway configuration:");
    println!("- Address: {:#06x}", config.gateway_address);
    println!("- Tick: {:?}, ack timeout: {:?}", config.tick_interval, config.ack_timeout);

    let (radio_tx, mut radio_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let gateway = match Gateway::new(config, radio_tx, events_tx, Instant::now()) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return;
        }
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let engine = tokio::spawn(run(gateway, inbound_rx, async {
        let _ = stop_rx.await;
    }));

    // Management layer comes up, then the node asks to be included
    let _ = inbound_tx
        .send(InboundEvent::Management(ManagementCommand::Init))
        .await;
    let include = Frame::addressed(
        config_gateway(),
        0,
        FunctionCode::IncludeReq,
        HalfSeconds::ZERO,
        NODE_ID.to_be_bytes().to_vec(),
    );
    let _ = inbound_tx.send(InboundEvent::RadioFrame(node_bytes(include))).await;

    let mut codec = RadioCodec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(12));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(command) = radio_rx.recv() => match command {
                RadioCommand::MeasureRssi => {
                    let _ = inbound_tx.send(InboundEvent::Rssi(-64)).await;
                }
                RadioCommand::Transmit(bytes) => {
                    let mut buf = BytesMut::from(&bytes[..]);
                    let frame = match codec.decode(&mut buf) {
                        Ok(Some(frame)) => frame,
                        _ => continue,
                    };
                    println!("Radio Tx: {:?} to {:#06x}", frame.function(), frame.destination());
                    // The node acks everything that expects an ack
                    if let Frame::Addressed(addressed) = &frame {
                        if !addressed.function.is_fire_and_forget() {
                            let ack = Frame::addressed(
                                config_gateway(),
                                granted_address(),
                                FunctionCode::Ack,
                                HalfSeconds::ZERO,
                                Vec::new(),
                            );
                            let _ = inbound_tx.send(InboundEvent::RadioFrame(node_bytes(ack))).await;
                        }
                    }
                }
            },
            Some(event) = events_rx.recv() => {
                println!("Management event: {:?}", event);
                if let ManagementEvent::IncludeReq { id, .. } = event {
                    let grant = ManagementCommand::IncludeGrant { id, address: None };
                    let _ = inbound_tx.send(InboundEvent::Management(grant)).await;
                }
            }
        }
    }

    let _ = stop_tx.send(());
    match engine.await {
        Ok(Ok(())) => println!("Gateway stopped"),
        Ok(Err(e)) => eprintln!("Gateway error: {}", e),
        Err(e) => eprintln!("Gateway task failed: {}", e),
    }
}

fn config_gateway() -> u16 {
    GatewayConfig::default().gateway_address
}

/// First address handed out by a fresh registry
fn granted_address() -> u16 {
    1
}

fn node_bytes(frame: Frame) -> bytes::Bytes {
    let mut codec = RadioCodec::new();
    let mut buf = BytesMut::new();
    if let Err(e) = codec.encode(frame, &mut buf) {
        eprintln!("Could not encode node frame: {}", e);
    }
    buf.freeze()
}
