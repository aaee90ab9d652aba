fn main() -> anyhow::Result<()> {
    service_queue_lib::run()
}
