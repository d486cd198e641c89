mod app;
mod parsing;
mod templates;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
