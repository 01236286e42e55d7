use async_trait::async_trait;
use blecentral::api::{
    event_channel, BleStack, CharPropFlags, DiscoveredCharacteristic, PeripheralDescriptor,
    PeripheralId, PowerState, ScanFilter, StackEvent, StackEventSender, ValueNotification,
    WriteType,
};
use blecentral::{Manager, ManagerConfig};
use futures::stream::StreamExt;
use std::error::Error;
use std::time::Duration;
use tokio::time;
use uuid::Uuid;

const PERIPHERAL_NAME_MATCH_FILTER: &str = "FE"; // filter BLE device by partial name
const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
const BODY_SENSOR_LOCATION: Uuid = Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);

/// A radio with a single heart rate monitor in range, answering every command right away.
#[derive(Debug)]
struct SimulatedRadio {
    events: StackEventSender,
}

impl SimulatedRadio {
    fn emit(&self, event: StackEvent) -> blecentral::Result<()> {
        self.events
            .unbounded_send(event)
            .map_err(|_| blecentral::Error::ManagerStopped)
    }
}

#[async_trait]
impl BleStack for SimulatedRadio {
    fn power_state(&self) -> PowerState {
        PowerState::PoweredOn
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> blecentral::Result<()> {
        self.emit(StackEvent::ScanResult(PeripheralDescriptor::new(
            "sim-0001",
            "FE-HeartRate",
            -48,
        )))
    }

    async fn stop_scan(&self) -> blecentral::Result<()> {
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> blecentral::Result<()> {
        self.emit(StackEvent::Connected(peripheral.clone()))
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> blecentral::Result<()> {
        self.emit(StackEvent::Disconnected(peripheral.clone()))
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> blecentral::Result<()> {
        self.emit(StackEvent::ServicesDiscovered {
            peripheral: peripheral.clone(),
            result: Ok(vec![HEART_RATE_SERVICE]),
        })
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> blecentral::Result<()> {
        self.emit(StackEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service,
            result: Ok(vec![
                DiscoveredCharacteristic::new(HEART_RATE_MEASUREMENT, CharPropFlags::NOTIFY),
                DiscoveredCharacteristic::new(BODY_SENSOR_LOCATION, CharPropFlags::READ),
            ]),
        })
    }

    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> blecentral::Result<()> {
        // 1 = chest
        self.emit(StackEvent::ValueUpdated {
            peripheral: peripheral.clone(),
            characteristic,
            result: Ok(vec![1]),
        })
    }

    async fn write(
        &self,
        _peripheral: &PeripheralId,
        _characteristic: Uuid,
        _data: &[u8],
        _write_type: WriteType,
    ) -> blecentral::Result<()> {
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> blecentral::Result<()> {
        self.emit(StackEvent::NotifyStateChanged {
            peripheral: peripheral.clone(),
            characteristic,
            result: Ok(enabled),
        })?;
        if enabled {
            let events = self.events.clone();
            let peripheral = peripheral.clone();
            tokio::spawn(async move {
                for bpm in [62u8, 64, 67, 71, 70] {
                    time::sleep(Duration::from_millis(250)).await;
                    let event = StackEvent::ValueUpdated {
                        peripheral: peripheral.clone(),
                        characteristic,
                        result: Ok(vec![0x00, bpm]),
                    };
                    if events.unbounded_send(event).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }
}

/// Processing received BLE data
fn on_measurement(data: ValueNotification) {
    match data.value.as_slice() {
        [_flags, bpm, ..] => println!("Heart rate from [{}] = {} bpm", data.uuid, bpm),
        other => println!("Malformed measurement from [{}]: {:?}", data.uuid, other),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let (events, receiver) = event_channel();
    let manager = Manager::new(SimulatedRadio { events }, receiver, ManagerConfig::default())?;

    let mut scan = manager.scan([PERIPHERAL_NAME_MATCH_FILTER]).await?;
    let visible = time::timeout(Duration::from_secs(2), scan.next())
        .await?
        .unwrap_or_default();
    manager.stop_scan().await?;

    let Some(target) = visible.first() else {
        eprintln!("->>> BLE peripheral devices were not found, sorry. Exiting...");
        return Ok(());
    };
    println!("found matching peripheral : {}...", target);

    let device = manager.connect(&target.id, Duration::from_secs(10)).await?;
    println!("now connected to {}", device);
    for characteristic in &device.characteristics {
        println!("  {}", characteristic);
    }

    let location = manager.read(BODY_SENSOR_LOCATION).await?;
    println!("Body sensor location = {:?}", location);

    let mut measurements = manager.subscribe(HEART_RATE_MEASUREMENT).await?;
    for _ in 0..5 {
        match measurements.next().await {
            Some(data) => on_measurement(data),
            None => break,
        }
    }

    manager.unsubscribe(HEART_RATE_MEASUREMENT).await?;
    println!("disconnecting from peripheral : {}...", device.name());
    manager.disconnect().await?;
    manager.shutdown();
    Ok(())
}
