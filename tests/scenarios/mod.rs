mod crud_test;
mod dump_test;
mod lock_test;
mod watch_test;
