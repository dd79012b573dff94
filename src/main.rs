fn main() {
    lanward_lib::run()
}
