use serial_duplex_io::{
    BufferConfig, NativeSerial, PumpConfig, SerialError, SerialEvent, UartDevice,
};
use std::env;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("debug")
    )
    .format(|buf, record| {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            buf,
            "[{} {}] {}",
            ts,
            record.level(),
            record.args()
        )
    })
    .init();

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    if args.len() != 3 {
        eprintln!("Usage: {} <device> <baud>", args[0]);
        eprintln!("Example: {} /dev/ttyUSB0 115200", args[0]);
        std::process::exit(1);
    }

    let device = &args[1];
    let baud_rate = match args[2].parse::<u32>() {
        Ok(baud) => baud,
        Err(_) => {
            eprintln!("Error: Invalid baud rate '{}' - must be a number", args[2]);
            std::process::exit(1);
        }
    };

    println!("UART line echo over the duplex I/O pump");
    println!("Device: {}", device);
    println!("Baud rate: {}", baud_rate);
    println!();

    let uart = match UartDevice::open(device, baud_rate) {
        Ok(uart) => {
            println!(
                "✓ Successfully opened UART connection to {} at {} baud",
                device,
                uart.baud_rate()
            );
            uart
        }
        Err(e) => {
            eprintln!("✗ Failed to open UART connection: {}", e);
            eprintln!();
            eprintln!("Make sure:");
            eprintln!("  - The device exists and you have permission to access it");
            eprintln!("  - No other program is using the device");
            eprintln!("  - The device is connected and powered on");
            std::process::exit(1);
        }
    };

    let serial = match NativeSerial::new(uart, BufferConfig::default(), PumpConfig::default()) {
        Ok(serial) => serial,
        Err(e) => {
            eprintln!("✗ Failed to create buffers: {}", e);
            std::process::exit(1);
        }
    };

    let events = serial.subscribe();
    if let Err(e) = serial.start() {
        eprintln!("✗ Failed to start I/O pump: {}", e);
        std::process::exit(1);
    }
    println!("✓ I/O pump started successfully");

    let consumer = match serial.consumer() {
        Ok(consumer) => consumer,
        Err(e) => {
            eprintln!("✗ Failed to attach to buffers: {}", e);
            std::process::exit(1);
        }
    };

    // Events fire on the pump threads; log them from our own
    thread::spawn(move || {
        for event in events {
            match event {
                SerialEvent::DataReceived { bytes, available } => {
                    log::debug!("received {} bytes, {} waiting", bytes, available)
                }
                SerialEvent::PinChanged(pins) => log::info!("pins changed: {:?}", pins),
                SerialEvent::ErrorReceived(errors) => log::warn!("line errors: {:?}", errors),
            }
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\n🛑 Shutting down...");
        r.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl+C handler: {}", e);
    }

    println!();
    println!("📡 Listening for lines on {}", device);
    println!("🔁 Each received line is sent back");
    println!("⏹️  Press Ctrl+C to stop");
    println!();

    let mut lines = 0usize;
    while running.load(Ordering::SeqCst) {
        match consumer.read_line(Some(Duration::from_secs(1))) {
            Ok(Some(line)) => {
                lines += 1;
                log::info!("line {}: {:?}", lines, line);
                let reply = format!("{}\n", line);
                if let Err(e) = consumer.write_str(&reply, Some(Duration::from_secs(1))) {
                    eprintln!("✗ Write failed: {}", e);
                    break;
                }
            }
            Ok(None) => {}
            Err(SerialError::DeviceDead) => {
                eprintln!("✗ Device stopped responding");
                break;
            }
            Err(e) => {
                eprintln!("✗ Read failed: {}", e);
                break;
            }
        }
    }

    consumer.flush(Some(Duration::from_secs(1)));
    serial.stop();
    println!("✓ Echoed {} lines. Exiting...", lines);
}
