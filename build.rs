use std::process::Command;

fn git_hash() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=GOSSIPKV_BUILD_HASH");

    let hash = std::env::var("GOSSIPKV_BUILD_HASH").unwrap_or_else(|_| git_hash());
    let date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    println!("cargo:rustc-env=GOSSIPKV_BUILD_HASH={hash}");
    println!("cargo:rustc-env=GOSSIPKV_BUILD_DATE={date}");
}
