use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("cipher-relay {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: cipher-relay");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("CIPHER_RELAY_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("CIPHER_RELAY_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!(
        "protocol: {} v{}",
        String::from_utf8_lossy(cipher_relay_peer::MAGIC),
        cipher_relay_peer::PROTOCOL_VERSION
    );
    println!("cipher: chacha20-poly1305, hkdf-sha256");

    Ok(SUCCESS)
}
