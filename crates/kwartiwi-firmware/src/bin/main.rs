#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_net::{DhcpConfig, Stack, StackResources};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, with_timeout};
use embedded_hal_bus::spi::{ExclusiveDevice, NoDelay};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::rng::Rng;
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config, Spi};
use esp_hal::time::Rate;
use esp_hal::Blocking;
use esp_hal::timer::timg::TimerGroup;
use log::{LevelFilter, debug, error, info, warn};
use rtt_target::rprintln;
use static_cell::StaticCell;

use kwartiwi_core::data_manager::DataManager;
use kwartiwi_core::event_bus::{DataEvent, Event, EventBase, EventBus, NetworkingEvent, TelemetryEvent};
use kwartiwi_core::networking::{Networking, ScanState};
use kwartiwi_core::telemetry::{ServerDirectory, TelemetryClient, discover_servers};
use kwartiwi_core::touch::{TouchState, Tsc2046};
use kwartiwi_firmware::flash_store::FlashConfigStore;
use kwartiwi_firmware::http_transport::TcpHttpTransport;
use kwartiwi_firmware::mdns::UdpServiceBrowser;
use kwartiwi_firmware::provisioning;
use kwartiwi_firmware::wifi::{DeviceNetworking, RadioHandle, net_task, wifi_task};

/// TSC2046 conversions are only reliable well below its 2.5 MHz limit
const TOUCH_SPI_KHZ: u32 = 500;
const TOUCH_POLL_INTERVAL: Duration = Duration::from_millis(20);
const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

type TouchSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, NoDelay>;
type DeviceTelemetry = TelemetryClient<'static, TcpHttpTransport>;

static BUS: EventBus = EventBus::new();
static SERVERS: ServerDirectory = ServerDirectory::new();
/// Raised on every association so discovery reruns on the new network
static LINK_UP: Signal<CriticalSectionRawMutex, ()> = Signal::new();

static DATA: StaticCell<DataManager<'static>> = StaticCell::new();
static NETWORKING: StaticCell<DeviceNetworking> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[embassy_executor::task]
async fn event_bus_task(bus: &'static EventBus) {
    bus.run().await;
}

#[embassy_executor::task]
async fn touch_task(mut touch: Tsc2046<TouchSpi>) {
    let mut last = TouchState::Released;
    loop {
        match touch.read(false) {
            Ok(sample) if sample.state != last => {
                last = sample.state;
                match sample.state {
                    TouchState::Pressed => info!("Touch at ({}, {})", sample.x, sample.y),
                    TouchState::Released => debug!("Touch released"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Touch read failed: {:?}", e),
        }
        Timer::after(TOUCH_POLL_INTERVAL).await;
    }
}

#[embassy_executor::task]
async fn telemetry_task(mut client: DeviceTelemetry) {
    client.run().await;
}

#[embassy_executor::task]
async fn discovery_task(stack: Stack<'static>) {
    let mut browser = UdpServiceBrowser::new(stack);
    loop {
        LINK_UP.wait().await;
        discover_servers(&mut browser, &SERVERS, &BUS).await;
        for server in SERVERS.servers() {
            info!("Server available: {}:{}", server.hostname, server.port);
        }
    }
}

async fn subscribe_logging(bus: &'static EventBus) {
    let subscribed = async {
        bus.subscribe(EventBase::Networking, |event| match event {
            Event::Networking(NetworkingEvent::Connected) => {
                info!("Wi-Fi connected");
                LINK_UP.signal(());
            }
            Event::Networking(NetworkingEvent::Disconnected) => {
                warn!("Wi-Fi gave up reconnecting")
            }
            other => debug!("{:?}", other),
        })
        .await?;
        bus.subscribe(EventBase::Telemetry, |event| match event {
            Event::Telemetry(TelemetryEvent::Connected) => info!("Meter server reachable"),
            Event::Telemetry(TelemetryEvent::Disconnected) => warn!("Meter server unreachable"),
            other => debug!("{:?}", other),
        })
        .await?;
        bus.subscribe(EventBase::Data, |event| {
            if *event == Event::Data(DataEvent::HistoryAvailable) {
                info!("Demand history loaded");
            }
        })
        .await
    };
    if let Err(e) = subscribed.await {
        error!("Event subscription failed: {}", e);
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!(LevelFilter::Info);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    rprintln!("Embassy initialized!");

    // Event plumbing comes first so nothing published during setup is lost
    spawner
        .spawn(event_bus_task(&BUS))
        .expect("event_bus_task spawn");
    subscribe_logging(&BUS).await;
    let data: &'static DataManager<'static> = DATA.init(DataManager::new(&BUS));

    let mut store = FlashConfigStore::open().expect("Configuration storage unavailable");
    match provisioning::seed_missing(&mut store) {
        Ok(0) => {}
        Ok(written) => info!("Provisioned {} configuration keys", written),
        Err(e) => error!("Provisioning failed: {}", e),
    }

    // Touch panel on SPI2
    let spi_config = Config::default()
        .with_frequency(Rate::from_khz(TOUCH_SPI_KHZ))
        .with_mode(Mode::_0);
    let spi_bus = Spi::new(peripherals.SPI2, spi_config)
        .expect("Failed to configure touch SPI")
        .with_sck(peripherals.GPIO36)
        .with_mosi(peripherals.GPIO37)
        .with_miso(peripherals.GPIO35);
    let touch_cs = Output::new(peripherals.GPIO38, Level::High, OutputConfig::default());
    let touch_spi =
        ExclusiveDevice::new_no_delay(spi_bus, touch_cs).expect("Failed to claim touch CS");

    let touch = Tsc2046::new(touch_spi);
    if let Err(e) = touch.load_calibration(&mut store) {
        warn!("Ignoring stored touch calibration: {}", e);
    }
    spawner
        .spawn(touch_task(touch))
        .expect("touch_task spawn");

    // Wi-Fi station and IP stack
    let radio = RADIO.init(esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller"));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(DhcpConfig::default()),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );
    spawner.spawn(net_task(runner)).expect("net_task spawn");

    let networking: &'static DeviceNetworking = NETWORKING.init(Networking::new(RadioHandle, &BUS));
    spawner
        .spawn(wifi_task(wifi_controller, stack, networking, spawner))
        .expect("wifi_task spawn");

    networking
        .setup(&mut store)
        .await
        .expect("Networking setup failed");

    if networking.has_credentials().await {
        if let Err(e) = networking.connect().await {
            error!("Connect request failed: {:?}", e);
        }
    } else {
        warn!("No Wi-Fi credentials stored, scanning instead");
        match networking.scan().await {
            Ok(()) => {
                let done = with_timeout(SCAN_TIMEOUT, async {
                    while networking.scan_state() != ScanState::Done {
                        Timer::after(Duration::from_millis(100)).await;
                    }
                })
                .await;
                if done.is_ok() {
                    for ap in networking.scan_results().await.unwrap_or_default() {
                        info!("Network {} ({} dBm)", ap.ssid.as_str(), ap.rssi);
                    }
                }
            }
            Err(e) => error!("Scan request failed: {:?}", e),
        }
    }

    spawner
        .spawn(discovery_task(stack))
        .expect("discovery_task spawn");

    match TelemetryClient::new(TcpHttpTransport::new(stack), data, &BUS, &mut store) {
        Ok(client) => spawner
            .spawn(telemetry_task(client))
            .expect("telemetry_task spawn"),
        Err(e) => warn!("Telemetry disabled: {}", e),
    }

    loop {
        Timer::after(Duration::from_secs(60)).await;
        let snapshot = data.snapshot().await;
        info!(
            "Demand {} kW, month peak {} kW, address {:?}",
            snapshot.current_avg_demand,
            snapshot.max_demand_month.demand,
            networking.ip_address()
        );
    }
}
