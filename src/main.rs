fn main() {
    std::process::exit(logsense_lib::run());
}
