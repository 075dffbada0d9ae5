fn main() -> std::process::ExitCode {
    evanesco::main()
}
