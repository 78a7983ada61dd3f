pub mod common;
pub mod podscaler_e2e;

use common::Error;
use podscaler_e2e::{
    podscaler_admission_e2e_test, podscaler_e2e_test, podscaler_scaling_e2e_test,
};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    match cmd.as_str() {
        "podscaler" => {
            println!("Running podscaler end-to-end test");
            return podscaler_e2e_test().await;
        }
        "podscaler-scaling" => {
            println!("Running podscaler end-to-end test for scaling");
            return podscaler_scaling_e2e_test().await;
        }
        "podscaler-admission" => {
            println!("Running podscaler end-to-end test for admission");
            return podscaler_admission_e2e_test().await;
        }
        _ => {
            println!("Please specify one test");
            Ok(())
        }
    }
}
