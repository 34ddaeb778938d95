//! Sample streaming client for codexec
//!
//! Sends one coding task and prints every streamed chunk as it arrives.
//!
//! ```text
//! codexec-client --prompt "print the first 10 primes in python"
//! ```

use clap::Parser;
use tonic::Code;

use codexec::grpc::codexec::coder_service_client::CoderServiceClient;
use codexec::grpc::codexec::CodeRequest;

#[derive(Parser, Debug)]
#[command(name = "codexec-client", about = "Send a coding task to a codexec server")]
struct Args {
    /// Server address
    #[arg(long, env = "CODEXEC_ADDR", default_value = "http://localhost:50051")]
    addr: String,

    /// The task for the model
    #[arg(long, short)]
    prompt: String,

    /// Override the server's system prompt
    #[arg(long, default_value = "")]
    system_prompt: String,

    /// Image the code runs in
    #[arg(long, default_value = "")]
    image: String,

    /// Model to use
    #[arg(long, default_value = "")]
    model: String,

    /// Attempts before giving up (0 = server default)
    #[arg(long, default_value_t = 0)]
    max_retry: i32,

    /// Hint folded into the server-side workdir name
    #[arg(long, default_value = "")]
    workdir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut client = CoderServiceClient::connect(args.addr.clone()).await?;

    let request = CodeRequest {
        system_prompt: args.system_prompt,
        user_prompt: args.prompt,
        working_directory: args.workdir,
        docker_image: args.image,
        max_retry: args.max_retry,
        llm_model: args.model,
    };

    let mut stream = client.execute_code(request).await?.into_inner();
    loop {
        match stream.message().await {
            Ok(Some(chunk)) => print!("{}", chunk.data),
            Ok(None) => {
                println!("[INFO] task finished");
                return Ok(());
            }
            Err(status) if status.code() == Code::Aborted => {
                eprintln!("[WARN] {}", status.message());
                std::process::exit(2);
            }
            Err(status) => {
                eprintln!("[ERROR] {:?}: {}", status.code(), status.message());
                std::process::exit(1);
            }
        }
    }
}
