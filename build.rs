use std::env;

// pnet's datalink backend on Windows links against the Npcap SDK.
const DEFAULT_NPCAP_SDK_LIB: &str = r"C:\Npcap-SDK\Lib\x64";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=NPCAP_SDK_LIB");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        return;
    }

    let sdk_lib = env::var("NPCAP_SDK_LIB").unwrap_or_else(|_| DEFAULT_NPCAP_SDK_LIB.to_string());
    println!("cargo:rustc-link-search=native={}", sdk_lib);
    println!("cargo:rustc-link-lib=static=Packet");
}
