fn main() {
    // ── macOS: CoreBluetooth needs an embedded Info.plist ─────────────────────
    //
    // A bare CLI binary has no app bundle, so CBCentralManager never leaves the
    // "unauthorised" state and the armband is never discovered.  Linking the
    // plist into the `__TEXT,__info_plist` section gives the binary the
    // NSBluetoothAlwaysUsageDescription key that the permission prompt reads.
    //
    // `CARGO_CFG_TARGET_OS` is the target OS, so this also applies when
    // cross-compiling for macOS from another host.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
