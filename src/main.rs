fn main() {
    peercall_lib::run()
}
