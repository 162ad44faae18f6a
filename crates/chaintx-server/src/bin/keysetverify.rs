use chaintx_server::keysetverify::{verify_index_zero, VerifyArgs, EXIT_INVALID};
use clap::Parser;

fn main() {
    let args = VerifyArgs::parse();
    let (report, exit_code) = verify_index_zero(&args);
    match serde_json::to_string_pretty(&report) {
        Ok(encoded) => println!("{encoded}"),
        Err(_) => {
            eprintln!(
                r#"{{"match":false,"reason":"failed to encode result","error_code":"result_encode_failed"}}"#
            );
            std::process::exit(EXIT_INVALID);
        }
    }
    std::process::exit(exit_code);
}
