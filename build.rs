//! Build script for fwconverge
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for the `--version` output, and lets packagers override the default tool
//! names at compile time.

fn main() {
    // Re-run build if these environment variables change
    println!("cargo:rerun-if-env-changed=FWCONVERGE_IPTABLES");
    println!("cargo:rerun-if-env-changed=FWCONVERGE_IP6TABLES");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
