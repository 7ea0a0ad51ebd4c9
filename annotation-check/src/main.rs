fn main() -> anyhow::Result<()> {
    annotation_check::main()
}
