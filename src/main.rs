fn main() {
    studyclock_lib::run()
}
