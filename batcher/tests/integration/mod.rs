mod batch_register_test;
mod drain_queue_test;
